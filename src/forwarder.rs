use crate::config::ConnectionStore;
use crate::resolver::{self, TransportSpec};
use crate::session::ProxySession;
use crate::transport::extract_json_payload;
use serde_json::Value;

/// How a message ultimately left the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryRoute {
    /// POSTed to one of the inferred HTTP endpoints
    Endpoint(String),
    /// Written over the live transport's native send (stdio)
    NativeSend,
}

/// Outcome of a forward attempt. Queued is a soft success: the message
/// waits for the next controller attach, on the assumption the downstream
/// server answers over its already-open SSE stream anyway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { via: DeliveryRoute },
    Queued,
}

impl DeliveryOutcome {
    pub fn status_text(&self) -> String {
        match self {
            DeliveryOutcome::Delivered {
                via: DeliveryRoute::Endpoint(url),
            } => format!("delivered to {url}"),
            DeliveryOutcome::Delivered {
                via: DeliveryRoute::NativeSend,
            } => "delivered over live transport".to_string(),
            DeliveryOutcome::Queued => "queued for delivery".to_string(),
        }
    }
}

/// Best-effort forwarder for browser-originated JSON-RPC messages.
///
/// MCP server POST endpoints are not uniformly discoverable, so delivery is
/// an ordered list of strategies rather than a single authoritative route:
/// inferred HTTP endpoints first, then the transport's native send, then
/// the session queue. The forwarder never mutates session state beyond
/// appending to the queue and pushing response bodies to the controller.
#[derive(Debug, Clone)]
pub struct MessageForwarder {
    store: ConnectionStore,
    client: reqwest::Client,
}

impl MessageForwarder {
    pub fn new(store: ConnectionStore) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
        }
    }

    /// Candidate POST endpoints for a downstream SSE URL, in trial order:
    /// `<base>/message`, the SSE URL itself, then the bare base.
    pub fn candidate_endpoints(sse_url: &str) -> Vec<String> {
        let base = sse_url
            .strip_suffix("/sse")
            .unwrap_or(sse_url)
            .trim_end_matches('/');

        let mut candidates = Vec::new();
        for candidate in [
            format!("{base}/message"),
            sse_url.to_string(),
            base.to_string(),
        ] {
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
        candidates
    }

    pub async fn forward(&self, session: &ProxySession, message: Value) -> DeliveryOutcome {
        session.touch();

        // The endpoint comes from stored config, not the live transport:
        // stdio transports expose no URL.
        let endpoint = self
            .store
            .get(&session.config_id)
            .and_then(|stored| match resolver::resolve_stored(&stored) {
                Ok(TransportSpec::Sse { url }) => Some(url),
                _ => None,
            });

        if let Some(sse_url) = endpoint {
            for candidate in Self::candidate_endpoints(&sse_url) {
                match self.client.post(&candidate).json(&message).send().await {
                    Ok(response) if response.status().is_success() => {
                        println!(
                            "📨 [{}] Forwarded message via {candidate}",
                            session.session_id
                        );
                        // Some servers answer the POST directly instead of
                        // pushing over SSE; relay that body to the browser
                        // as if it were an async event.
                        if let Ok(text) = response.text().await {
                            if !text.trim().is_empty() {
                                let payload = extract_json_payload(&text);
                                let event = serde_json::from_str(&payload)
                                    .unwrap_or_else(|_| Value::String(payload));
                                session.push_event(event);
                            }
                        }
                        return DeliveryOutcome::Delivered {
                            via: DeliveryRoute::Endpoint(candidate),
                        };
                    }
                    Ok(response) => {
                        tracing::debug!(
                            session_id = %session.session_id,
                            endpoint = %candidate,
                            status = %response.status(),
                            "candidate endpoint rejected message"
                        );
                    }
                    Err(e) => {
                        tracing::debug!(
                            session_id = %session.session_id,
                            endpoint = %candidate,
                            "candidate endpoint unreachable: {e}"
                        );
                    }
                }
            }
        }

        if session.client.supports_native_send() {
            match session.client.send_raw(&message).await {
                Ok(reply) => {
                    if let Some(reply) = reply {
                        session.push_event(reply);
                    }
                    return DeliveryOutcome::Delivered {
                        via: DeliveryRoute::NativeSend,
                    };
                }
                Err(e) => {
                    eprintln!(
                        "⚠️ [{}] Native send failed, queueing message: {e}",
                        session.session_id
                    );
                }
            }
        }

        session.queue_message(message);
        DeliveryOutcome::Queued
    }
}
