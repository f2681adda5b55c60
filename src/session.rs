use crate::client::McpClient;
use crate::config::ConnectionStore;
use crate::errors::{GatewayError, GatewayResult};
use crate::resolver;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Browser-facing half of a session: events sent here are drained by the
/// SSE response stream of the most recently attached browser connection.
pub type SessionController = mpsc::UnboundedSender<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Created by a connect or SSE open; the browser knows its id
    Standard,
    /// Created ad hoc to satisfy a tool call when no session existed.
    /// Stays in the registry so later lookups by config id find it.
    Temporary,
}

#[derive(Debug, Default)]
struct ChannelState {
    controller: Option<SessionController>,
    queue: VecDeque<Value>,
}

/// A gateway-owned downstream MCP connection that a browser reaches
/// indirectly through the gateway's own SSE endpoint.
#[derive(Debug)]
pub struct ProxySession {
    pub session_id: String,
    pub config_id: String,
    pub client: Arc<McpClient>,
    pub kind: SessionKind,
    pub created_at: DateTime<Utc>,
    state: Mutex<ChannelState>,
    last_used: Mutex<DateTime<Utc>>,
}

impl ProxySession {
    fn new(
        session_id: String,
        config_id: String,
        client: Arc<McpClient>,
        kind: SessionKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            config_id,
            client,
            kind,
            created_at: now,
            state: Mutex::new(ChannelState::default()),
            last_used: Mutex::new(now),
        }
    }

    /// Bind a browser SSE controller, flushing any queued messages in FIFO
    /// order. Last attach wins: a previous controller is dropped, not
    /// queued behind.
    pub fn attach_controller(&self, controller: SessionController) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        while let Some(message) = state.queue.pop_front() {
            if let Err(e) = controller.send(message) {
                // Receiver already gone; keep the rest for the next attach
                state.queue.push_front(e.0);
                state.controller = None;
                return;
            }
        }
        state.controller = Some(controller);
    }

    /// Unbind only if `controller` is still the bound one, so a stale
    /// browser disconnect never detaches a newer connection.
    pub fn detach_controller_if(&self, controller: &SessionController) {
        if let Ok(mut state) = self.state.lock() {
            if state
                .controller
                .as_ref()
                .is_some_and(|c| c.same_channel(controller))
            {
                state.controller = None;
            }
        }
    }

    /// Deliver an event to the attached browser, or queue it for the next
    /// attach. Returns true when delivered live.
    pub fn push_event(&self, event: Value) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if let Some(controller) = &state.controller {
            match controller.send(event) {
                Ok(()) => return true,
                Err(e) => {
                    // Browser went away without a detach; fall back to queueing
                    state.controller = None;
                    state.queue.push_back(e.0);
                    return false;
                }
            }
        }
        state.queue.push_back(event);
        false
    }

    pub fn queue_message(&self, message: Value) {
        if let Ok(mut state) = self.state.lock() {
            state.queue.push_back(message);
        }
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    pub fn has_controller(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.controller.is_some())
            .unwrap_or(false)
    }

    pub fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Utc::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_used.lock().map(|l| *l).unwrap_or(self.created_at);
        (Utc::now() - last).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Process-wide registry of proxy sessions.
///
/// Owned by the composition root and injected into handlers; cheap to
/// clone, all clones share the same map. Registry mutations are plain map
/// inserts/removes with no await while the lock is held.
#[derive(Debug, Clone)]
pub struct SessionManager {
    sessions: Arc<tokio::sync::RwLock<HashMap<String, Arc<ProxySession>>>>,
    store: ConnectionStore,
}

impl SessionManager {
    pub fn new(store: ConnectionStore) -> Self {
        Self {
            sessions: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            store,
        }
    }

    pub fn store(&self) -> &ConnectionStore {
        &self.store
    }

    /// Resolve the stored config, connect an MCP client over the resulting
    /// transport, and register a fresh session with an empty queue and no
    /// controller.
    pub async fn create_session(&self, config_id: &str) -> GatewayResult<Arc<ProxySession>> {
        let session_id = format!("session_{}", Uuid::new_v4());
        self.connect_and_register(config_id, session_id, SessionKind::Standard)
            .await
    }

    /// Same connect logic as `create_session`, but the session exists
    /// purely to satisfy tool calls: no browser-facing controller will ever
    /// attach. It is registered under a synthetic id so later lookups by
    /// config id can reuse it.
    pub async fn create_temporary_session(
        &self,
        config_id: &str,
    ) -> GatewayResult<Arc<ProxySession>> {
        let session_id = format!("temp_{}_{}", config_id, Utc::now().timestamp_millis());
        self.connect_and_register(config_id, session_id, SessionKind::Temporary)
            .await
    }

    async fn connect_and_register(
        &self,
        config_id: &str,
        session_id: String,
        kind: SessionKind,
    ) -> GatewayResult<Arc<ProxySession>> {
        let stored = self
            .store
            .get(config_id)
            .ok_or_else(|| GatewayError::ConfigNotFound {
                config_id: config_id.to_string(),
            })?;
        let spec = resolver::resolve_stored(&stored)?;

        // Connect failures must reach the caller: the browser has no other
        // way to learn the proxied server is unreachable.
        let client = McpClient::connect(&spec).await.map_err(|source| {
            GatewayError::DownstreamConnectFailed {
                config_id: config_id.to_string(),
                source,
            }
        })?;

        let session = Arc::new(ProxySession::new(
            session_id.clone(),
            config_id.to_string(),
            Arc::new(client),
            kind,
        ));

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session.clone());
        println!(
            "✅ Registered {} session '{}' for config '{}'",
            match kind {
                SessionKind::Standard => "proxy",
                SessionKind::Temporary => "temporary",
            },
            session_id,
            config_id
        );

        // SSE downstreams push events asynchronously; pump them into the
        // session so the browser's SSE stream sees them.
        if let Some(sse_url) = session.client.sse_url() {
            tokio::spawn(pump_downstream_events(session.clone(), sse_url.to_string()));
        }

        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<ProxySession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// The most recently created session for a config id, if any. O(n) scan;
    /// fine at tens of sessions.
    pub async fn find_latest_session_for(&self, config_id: &str) -> Option<Arc<ProxySession>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.config_id == config_id)
            .max_by_key(|s| s.created_at)
            .cloned()
    }

    /// Any live session at all, used by the bare-connection-id heuristic.
    /// Picks the newest by creation time so adoption is stable when several
    /// sessions are live.
    pub async fn any_session(&self) -> Option<Arc<ProxySession>> {
        self.sessions
            .read()
            .await
            .values()
            .max_by_key(|s| s.created_at)
            .cloned()
    }

    pub async fn attach_controller(
        &self,
        session_id: &str,
        controller: SessionController,
    ) -> GatewayResult<Arc<ProxySession>> {
        let session =
            self.get(session_id)
                .await
                .ok_or_else(|| GatewayError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;
        session.attach_controller(controller);
        Ok(session)
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Evict temporary sessions idle past `max_idle`. The reaper is opt-in
    /// and leaves standard sessions alone so a quiet browser tab is never
    /// disconnected.
    pub async fn reap_idle_temporaries(&self, max_idle: Duration) -> usize {
        let stale: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.kind == SessionKind::Temporary && s.idle_for() > max_idle)
            .map(|s| s.session_id.clone())
            .collect();

        if stale.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write().await;
        let mut evicted = 0;
        for session_id in stale {
            if sessions.remove(&session_id).is_some() {
                println!("🧹 Evicted idle temporary session '{session_id}'");
                evicted += 1;
            }
        }
        evicted
    }

    /// Background reaper loop; only ever spawned when the operator opts in.
    pub fn spawn_reaper(&self, interval: Duration, max_idle: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let evicted = manager.reap_idle_temporaries(max_idle).await;
                if evicted > 0 {
                    println!("🧹 Temporary session reaper evicted {evicted} session(s)");
                }
            }
        });
    }

    #[cfg(test)]
    pub async fn insert_stub_session(
        &self,
        session_id: &str,
        config_id: &str,
        kind: SessionKind,
    ) -> Arc<ProxySession> {
        use crate::transport::{SseTransport, Transport};
        let client = Arc::new(McpClient::from_transport(Transport::Sse(SseTransport::stub(
            "http://127.0.0.1:1/sse",
            "http://127.0.0.1:1/message",
        ))));
        let session = Arc::new(ProxySession::new(
            session_id.to_string(),
            config_id.to_string(),
            client,
            kind,
        ));
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), session.clone());
        session
    }
}

/// Re-stream a downstream SSE server's events into the session. Runs until
/// the downstream stream ends or errors; no reconnect, matching the
/// one-shot EventSource the browser side expects.
async fn pump_downstream_events(session: Arc<ProxySession>, sse_url: String) {
    let client = reqwest::Client::new();
    let response = match client
        .get(&sse_url)
        .header("Accept", "text/event-stream")
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            eprintln!(
                "⚠️ [{}] Failed to open downstream event stream: {e}",
                session.session_id
            );
            return;
        }
    };

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.contains("text/event-stream") {
        return;
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                eprintln!(
                    "⚠️ [{}] Downstream event stream error: {e}",
                    session.session_id
                );
                break;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_string();
            buffer.drain(..=newline);

            if let Some(data) = line.strip_prefix("data: ") {
                let event = serde_json::from_str(data)
                    .unwrap_or_else(|_| Value::String(data.to_string()));
                session.push_event(event);
            }
        }
    }
    println!("📪 [{}] Downstream event stream closed", session.session_id);
}
