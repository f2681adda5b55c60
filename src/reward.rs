use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Priced reward for one tool result, as computed by the collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardQuote {
    pub amount: f64,
    #[serde(rename = "valueHash")]
    pub value_hash: String,
}

/// Receipt of an on-chain distribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    #[serde(rename = "txHash")]
    pub tx_hash: String,
}

/// Black-box boundary to the token-reward collaborator. Two phases:
/// compute a quote from the tool result, then submit the distribution.
/// The second phase is the longest-latency await in the whole gateway, so
/// callers must never hold session or registry locks across it.
#[async_trait]
pub trait RewardWorkflow: Send + Sync {
    async fn compute_reward(&self, tool_result: &Value, wallet_address: &str)
        -> Result<RewardQuote>;

    async fn distribute(&self, quote: &RewardQuote, wallet_address: &str) -> Result<Distribution>;
}

/// HTTP-backed reward collaborator
#[derive(Debug, Clone)]
pub struct HttpRewardWorkflow {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRewardWorkflow {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RewardWorkflow for HttpRewardWorkflow {
    async fn compute_reward(
        &self,
        tool_result: &Value,
        wallet_address: &str,
    ) -> Result<RewardQuote> {
        let response = self
            .client
            .post(format!("{}/compute", self.base_url))
            .json(&json!({
                "toolResult": tool_result,
                "walletAddress": wallet_address,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn distribute(&self, quote: &RewardQuote, wallet_address: &str) -> Result<Distribution> {
        let response = self
            .client
            .post(format!("{}/distribute", self.base_url))
            .json(&json!({
                "amount": quote.amount,
                "valueHash": quote.value_hash,
                "walletAddress": wallet_address,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Run both reward phases and fold the outcome into a `tokenDistribution`
/// JSON blob. Failures are captured here, never propagated: a tool call's
/// success must not be hidden by an unrelated reward failure.
pub async fn run_reward(
    workflow: &dyn RewardWorkflow,
    tool_result: &Value,
    wallet_address: &str,
) -> Value {
    let quote = match workflow.compute_reward(tool_result, wallet_address).await {
        Ok(quote) => quote,
        Err(e) => {
            eprintln!("⚠️ Reward computation failed for {wallet_address}: {e}");
            return json!({
                "success": false,
                "error": format!("reward computation failed: {e}"),
            });
        }
    };

    match workflow.distribute(&quote, wallet_address).await {
        Ok(distribution) => {
            println!(
                "💰 Distributed {} to {} (tx {})",
                quote.amount, wallet_address, distribution.tx_hash
            );
            json!({
                "success": true,
                "amount": quote.amount,
                "valueHash": quote.value_hash,
                "txHash": distribution.tx_hash,
            })
        }
        Err(e) => {
            eprintln!("⚠️ Reward distribution failed for {wallet_address}: {e}");
            json!({
                "success": false,
                "amount": quote.amount,
                "valueHash": quote.value_hash,
                "error": format!("reward distribution failed: {e}"),
            })
        }
    }
}
