use crate::client::McpClient;
use crate::config::ConnectionStore;
use crate::errors::{GatewayError, GatewayResult};
use crate::registry::ConnectionRegistry;
use crate::reward::{run_reward, RewardWorkflow};
use crate::session::SessionManager;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};

static HEX32_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{32}$").expect("hex id pattern"));

/// How a caller-supplied connection id should be handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Proxy { config_id: String },
    Direct,
}

/// Step 1: a `proxy_` prefix is definitive and never touches the direct
/// registry.
pub fn classify_proxy_prefix(connection_id: &str) -> Option<Classification> {
    connection_id
        .strip_prefix("proxy_")
        .map(|config_id| Classification::Proxy {
            config_id: config_id.to_string(),
        })
}

/// Step 2: a bare 32-hex id that names a stored config is promoted to
/// proxy handling.
pub fn classify_bare_config_id(
    connection_id: &str,
    store: &ConnectionStore,
) -> Option<Classification> {
    if HEX32_RE.is_match(connection_id) && store.contains(connection_id) {
        println!("🔁 Promoting bare config id '{connection_id}' to proxy handling");
        return Some(Classification::Proxy {
            config_id: connection_id.to_string(),
        });
    }
    None
}

/// Step 3: a `conn_*` id with any live proxy session adopts that session's
/// config. This reconciles the case where the browser's direct id and the
/// gateway's session bookkeeping have drifted apart.
pub async fn classify_drifted_connection(
    connection_id: &str,
    sessions: &SessionManager,
) -> Option<Classification> {
    if !connection_id.starts_with("conn_") {
        return None;
    }
    let session = sessions.any_session().await?;
    println!(
        "🔁 Adopting session '{}' config '{}' for drifted connection id '{connection_id}'",
        session.session_id, session.config_id
    );
    Some(Classification::Proxy {
        config_id: session.config_id.clone(),
    })
}

/// Ordered classification chain; the first definitive answer wins, and
/// anything left over is a direct connection.
pub async fn classify(
    connection_id: &str,
    store: &ConnectionStore,
    sessions: &SessionManager,
) -> Classification {
    if let Some(c) = classify_proxy_prefix(connection_id) {
        return c;
    }
    if let Some(c) = classify_bare_config_id(connection_id, store) {
        return c;
    }
    if let Some(c) = classify_drifted_connection(connection_id, sessions).await {
        return c;
    }
    Classification::Direct
}

/// Result of one orchestrated tool call
#[derive(Debug)]
pub struct ToolCallOutcome {
    pub result: Value,
    pub token_distribution: Option<Value>,
}

/// Resolves arbitrary connection ids to a usable MCP client, invokes the
/// tool, and optionally hands the result to the reward collaborator.
#[derive(Clone)]
pub struct Orchestrator {
    registry: ConnectionRegistry,
    sessions: SessionManager,
    reward: Option<Arc<dyn RewardWorkflow>>,
}

impl Orchestrator {
    pub fn new(
        registry: ConnectionRegistry,
        sessions: SessionManager,
        reward: Option<Arc<dyn RewardWorkflow>>,
    ) -> Self {
        Self {
            registry,
            sessions,
            reward,
        }
    }

    /// Resolve `connection_id` to a client. Proxy classifications reuse the
    /// newest session for the config before falling back to creating one
    /// temporary session; direct classifications get no safety net.
    async fn resolve_client(
        &self,
        connection_id: &str,
    ) -> GatewayResult<(Arc<McpClient>, bool)> {
        match classify(connection_id, self.sessions.store(), &self.sessions).await {
            Classification::Proxy { config_id } => {
                let session = match self.sessions.find_latest_session_for(&config_id).await {
                    Some(session) => session,
                    None => {
                        println!(
                            "🆕 No session for config '{config_id}', creating a temporary one"
                        );
                        self.sessions.create_temporary_session(&config_id).await?
                    }
                };
                session.touch();
                Ok((session.client.clone(), true))
            }
            Classification::Direct => {
                let client = self.registry.get(connection_id).await?;
                Ok((client, false))
            }
        }
    }

    pub async fn call_tool(
        &self,
        connection_id: &str,
        tool_name: &str,
        arguments: Value,
        wallet_address: Option<&str>,
    ) -> GatewayResult<ToolCallOutcome> {
        let (client, is_proxy) = self.resolve_client(connection_id).await?;

        println!("🔧 Calling tool '{tool_name}' via connection '{connection_id}'");
        let response = client
            .call_tool(tool_name, arguments)
            .await
            .map_err(|e| GatewayError::Internal {
                reason: format!("tool call failed: {e}"),
            })?;

        // Downstream protocol errors (method-not-found and similar) ride
        // along verbatim instead of being retried or rewritten.
        let result = response.get("result").cloned().unwrap_or(response);

        let token_distribution = match (is_proxy, wallet_address, &self.reward) {
            (true, Some(wallet), Some(workflow)) => {
                Some(run_reward(workflow.as_ref(), &result, wallet).await)
            }
            _ => None,
        };

        Ok(ToolCallOutcome {
            result,
            token_distribution,
        })
    }
}
