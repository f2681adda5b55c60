use crate::client::{McpClient, ToolListing};
use crate::config::ConnectionStore;
use crate::errors::GatewayError;
use crate::forwarder::MessageForwarder;
use crate::orchestrator::Orchestrator;
use crate::registry::ConnectionRegistry;
use crate::resolver::{self, ConnectRequest, Resolved};
use crate::reward::RewardWorkflow;
use crate::session::{ProxySession, SessionController, SessionManager};
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

/// Shared state for all gateway routes, assembled once at the composition
/// root. Every piece is cheaply cloneable and shared.
#[derive(Clone)]
pub struct GatewayState {
    pub store: ConnectionStore,
    pub registry: ConnectionRegistry,
    pub sessions: SessionManager,
    pub forwarder: MessageForwarder,
    pub orchestrator: Orchestrator,
}

impl GatewayState {
    pub fn new(store: ConnectionStore, reward: Option<Arc<dyn RewardWorkflow>>) -> Self {
        let registry = ConnectionRegistry::new();
        let sessions = SessionManager::new(store.clone());
        let forwarder = MessageForwarder::new(store.clone());
        let orchestrator = Orchestrator::new(registry.clone(), sessions.clone(), reward);
        Self {
            store,
            registry,
            sessions,
            forwarder,
            orchestrator,
        }
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/connect", post(connect_handler))
        .route("/proxy/{config_id}/sse", get(sse_handler))
        .route("/proxy/{config_id}/message", post(message_handler))
        .route("/proxy/{config_id}/tools", get(tools_handler))
        .route("/call-tool", post(call_tool_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: GatewayState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("🚀 Toolgate MCP gateway listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "toolgate",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// `POST /connect`: classify the request and either register a direct
/// connection or short-circuit to the proxy path. Gateway URLs never cause
/// an outbound network call.
async fn connect_handler(
    State(state): State<GatewayState>,
    Json(body): Json<ConnectRequest>,
) -> Result<Json<Value>, GatewayError> {
    match resolver::resolve(&body)? {
        Resolved::Proxy { config_id } => {
            println!("🔀 Connect request delegated to proxy for config '{config_id}'");
            Ok(Json(json!({
                "success": true,
                "connectionId": format!("proxy_{config_id}"),
                "isProxy": true,
                "configId": config_id,
            })))
        }
        Resolved::Direct {
            spec,
            connection_id_override,
        } => {
            let connection_id = connection_id_override
                .or_else(|| body.connection_id.clone())
                .unwrap_or_else(|| format!("conn_{}", Utc::now().timestamp_millis()));

            let client = McpClient::connect(&spec).await.map_err(|source| {
                GatewayError::ConnectFailed {
                    connection_id: connection_id.clone(),
                    source,
                }
            })?;
            state.registry.put(&connection_id, Arc::new(client)).await;

            Ok(Json(json!({
                "success": true,
                "connectionId": connection_id,
            })))
        }
    }
}

/// Browser-facing SSE stream, bridging the session's event channel. The
/// first frame announces the session id so the browser knows where to POST
/// messages. Dropping the stream (tab closed) unbinds the controller but
/// leaves the session and its downstream connection alive.
struct SessionEventStream {
    rx: mpsc::UnboundedReceiver<Value>,
    session: Arc<ProxySession>,
    controller: SessionController,
}

impl Stream for SessionEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(value)) => {
                let event = Event::default()
                    .json_data(&value)
                    .unwrap_or_else(|_| Event::default().data("null"));
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SessionEventStream {
    fn drop(&mut self) {
        self.session.detach_controller_if(&self.controller);
        println!("📪 Browser detached from session '{}'", self.session.session_id);
    }
}

/// `GET /proxy/:configId/sse`
async fn sse_handler(
    Path(config_id): Path<String>,
    State(state): State<GatewayState>,
) -> Result<Sse<KeepAliveStream<SessionEventStream>>, GatewayError> {
    let session = match state.sessions.find_latest_session_for(&config_id).await {
        Some(session) => session,
        None => state.sessions.create_session(&config_id).await?,
    };
    session.touch();

    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(json!({
        "type": "session",
        "sessionId": session.session_id,
        "configId": config_id,
    }));
    session.attach_controller(tx.clone());
    println!("📡 Browser attached to session '{}'", session.session_id);

    let stream = SessionEventStream {
        rx,
        session,
        controller: tx,
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(rename = "sessionId")]
    session_id: String,
    message: Value,
}

/// `POST /proxy/:configId/message`
async fn message_handler(
    Path(config_id): Path<String>,
    State(state): State<GatewayState>,
    Json(body): Json<MessageBody>,
) -> Result<Json<Value>, GatewayError> {
    let session = state.sessions.get(&body.session_id).await.ok_or_else(|| {
        GatewayError::SessionNotFound {
            session_id: body.session_id.clone(),
        }
    })?;
    if session.config_id != config_id {
        return Err(GatewayError::ConfigMismatch {
            expected: session.config_id.clone(),
            got: config_id,
        });
    }

    let outcome = state.forwarder.forward(&session, body.message).await;
    Ok(Json(json!({
        "success": true,
        "message": outcome.status_text(),
    })))
}

/// `GET /proxy/:configId/tools`: degrades method-not-found to an empty
/// tool list instead of an error.
async fn tools_handler(
    Path(config_id): Path<String>,
    State(state): State<GatewayState>,
) -> Result<Json<Value>, GatewayError> {
    let session = match state.sessions.find_latest_session_for(&config_id).await {
        Some(session) => session,
        None => state.sessions.create_temporary_session(&config_id).await?,
    };
    session.touch();

    match session.client.list_tools().await {
        Ok(ToolListing::Tools(tools)) => Ok(Json(json!({
            "success": true,
            "tools": tools,
        }))),
        Ok(ToolListing::Unsupported { message }) => Ok(Json(json!({
            "success": true,
            "tools": [],
            "message": format!("Downstream server does not implement tool listing: {message}"),
        }))),
        Err(e) => Err(GatewayError::Internal {
            reason: format!("tools/list failed: {e}"),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct CallToolBody {
    #[serde(rename = "connectionId")]
    connection_id: String,
    #[serde(rename = "toolName")]
    tool_name: String,
    #[serde(default)]
    arguments: Value,
    #[serde(rename = "walletAddress")]
    wallet_address: Option<String>,
}

/// `POST /call-tool`
async fn call_tool_handler(
    State(state): State<GatewayState>,
    Json(body): Json<CallToolBody>,
) -> Result<Json<Value>, GatewayError> {
    let arguments = if body.arguments.is_null() {
        json!({})
    } else {
        body.arguments
    };

    let outcome = state
        .orchestrator
        .call_tool(
            &body.connection_id,
            &body.tool_name,
            arguments,
            body.wallet_address.as_deref(),
        )
        .await?;

    let mut response = json!({
        "success": true,
        "result": outcome.result,
    });
    if let Some(token_distribution) = outcome.token_distribution {
        response["tokenDistribution"] = token_distribution;
    }
    Ok(Json(response))
}
