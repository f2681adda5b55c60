use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use toolgate::reward::{Distribution, RewardQuote, RewardWorkflow};
use toolgate::server::{router, GatewayState};
use toolgate::{ConnectionStore, ConnectionType, StoredConnection};
use tower::ServiceExt;

const HEX_ID: &str = "a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4";
const BARE_ID: &str = "ffffffffffffffffffffffffffffffff";

/// Minimal downstream MCP server: answers initialize, tools/list, and
/// tools/call over plain HTTP POST.
async fn mcp_stub(Json(request): Json<Value>) -> Json<Value> {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    match request.get("method").and_then(|m| m.as_str()).unwrap_or("") {
        "initialize" => Json(json!({
            "jsonrpc": "2.0", "id": id,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "stub", "version": "0.0.1"}
            }
        })),
        "notifications/initialized" => Json(json!({})),
        "tools/list" => Json(json!({
            "jsonrpc": "2.0", "id": id,
            "result": {"tools": [
                {"name": "echo", "description": "Echo input", "inputSchema": {"type": "object"}}
            ]}
        })),
        "tools/call" => {
            let tool = request
                .pointer("/params/name")
                .and_then(|n| n.as_str())
                .unwrap_or("unknown");
            Json(json!({
                "jsonrpc": "2.0", "id": id,
                "result": {"content": [{"type": "text", "text": format!("called {tool}")}]}
            }))
        }
        _ => Json(json!({
            "jsonrpc": "2.0", "id": id,
            "error": {"code": -32601, "message": "Method not found"}
        })),
    }
}

/// Downstream server that implements nothing beyond initialize
async fn bare_stub(Json(request): Json<Value>) -> Json<Value> {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    match request.get("method").and_then(|m| m.as_str()).unwrap_or("") {
        "initialize" => Json(json!({
            "jsonrpc": "2.0", "id": id,
            "result": {"protocolVersion": "2024-11-05", "capabilities": {}, "serverInfo": {"name": "bare", "version": "0"}}
        })),
        "notifications/initialized" => Json(json!({})),
        _ => Json(json!({
            "jsonrpc": "2.0", "id": id,
            "error": {"code": -32601, "message": "Method not found"}
        })),
    }
}

async fn spawn_downstream() -> Result<u16> {
    let app = Router::new()
        .route("/mcp", post(mcp_stub))
        .route("/mcp/message", post(mcp_stub))
        .route("/bare", post(bare_stub));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(port)
}

fn state_with_downstream(port: u16, reward: Option<Arc<dyn RewardWorkflow>>) -> GatewayState {
    let store = ConnectionStore::new();
    store.insert(
        HEX_ID,
        StoredConnection {
            name: Some("stub server".to_string()),
            connection_type: ConnectionType::Url,
            connection_config: json!({"url": format!("http://127.0.0.1:{port}/mcp")}),
        },
    );
    store.insert(
        BARE_ID,
        StoredConnection {
            name: None,
            connection_type: ConnectionType::Url,
            connection_config: json!({"url": format!("http://127.0.0.1:{port}/bare")}),
        },
    );
    GatewayState::new(store, reward)
}

async fn request_json(
    app: Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> Result<(StatusCode, Value)> {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))?,
        None => Request::builder().method(method).uri(uri).body(Body::empty())?,
    };
    let response = app.oneshot(request).await?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, value))
}

struct OkReward;

#[async_trait]
impl RewardWorkflow for OkReward {
    async fn compute_reward(&self, _: &Value, _: &str) -> Result<RewardQuote> {
        Ok(RewardQuote {
            amount: 7.5,
            value_hash: "0xvalue".to_string(),
        })
    }
    async fn distribute(&self, _: &RewardQuote, _: &str) -> Result<Distribution> {
        Ok(Distribution {
            tx_hash: "0xfeed".to_string(),
        })
    }
}

struct BrokenReward;

#[async_trait]
impl RewardWorkflow for BrokenReward {
    async fn compute_reward(&self, _: &Value, _: &str) -> Result<RewardQuote> {
        anyhow::bail!("reward service down")
    }
    async fn distribute(&self, _: &RewardQuote, _: &str) -> Result<Distribution> {
        anyhow::bail!("reward service down")
    }
}

#[tokio::test]
async fn test_connect_gateway_url_short_circuits_without_network() -> Result<()> {
    // The host does not exist; success proves no outbound call was made.
    let state = GatewayState::new(ConnectionStore::new(), None);
    let (status, body) = request_json(
        router(state),
        "POST",
        "/connect",
        Some(json!({"url": "http://no-such-host.invalid/api/proxy/abc123/sse"})),
    )
    .await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["isProxy"], true);
    assert_eq!(body["configId"], "abc123");
    assert_eq!(body["connectionId"], "proxy_abc123");
    Ok(())
}

#[tokio::test]
async fn test_connect_frontend_page_fails_fast() -> Result<()> {
    let state = GatewayState::new(ConnectionStore::new(), None);
    let (status, body) = request_json(
        router(state),
        "POST",
        "/connect",
        Some(json!({"url": "https://x.test/app?configId=abc123"})),
    )
    .await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "NotAnMcpEndpoint");
    assert!(body["message"]
        .as_str()
        .expect("message")
        .contains("frontend page"));
    Ok(())
}

#[tokio::test]
async fn test_connect_command_without_args() -> Result<()> {
    let state = GatewayState::new(ConnectionStore::new(), None);
    let (status, body) = request_json(
        router(state),
        "POST",
        "/connect",
        Some(json!({"command": "npx"})),
    )
    .await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "MissingArgs");
    Ok(())
}

#[tokio::test]
async fn test_message_unknown_session_is_404() -> Result<()> {
    let state = GatewayState::new(ConnectionStore::new(), None);
    let (status, body) = request_json(
        router(state),
        "POST",
        "/proxy/abc123/message",
        Some(json!({"sessionId": "session_nope", "message": {"jsonrpc": "2.0", "method": "ping"}})),
    )
    .await?;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "SessionNotFound");
    Ok(())
}

#[tokio::test]
async fn test_tools_unknown_config_is_404_and_registers_nothing() -> Result<()> {
    let state = GatewayState::new(ConnectionStore::new(), None);
    let app = router(state.clone());
    let (status, body) = request_json(app, "GET", "/proxy/deadbeef/tools", None).await?;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "ConfigNotFound");
    assert_eq!(state.sessions.len().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_call_tool_unknown_direct_connection_is_404() -> Result<()> {
    let state = GatewayState::new(ConnectionStore::new(), None);
    let (status, body) = request_json(
        router(state),
        "POST",
        "/call-tool",
        Some(json!({"connectionId": "something-direct", "toolName": "echo", "arguments": {}})),
    )
    .await?;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "ConnectionNotFound");
    Ok(())
}

#[tokio::test]
async fn test_call_tool_creates_then_reuses_temporary_session() -> Result<()> {
    let port = spawn_downstream().await?;
    let state = state_with_downstream(port, None);
    let app = router(state.clone());

    // First call: no session exists, one temporary session gets created
    let (status, body) = request_json(
        app.clone(),
        "POST",
        "/call-tool",
        Some(json!({"connectionId": format!("proxy_{HEX_ID}"), "toolName": "echo", "arguments": {"x": 1}})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["content"][0]["text"], "called echo");
    assert!(body.get("tokenDistribution").is_none());
    assert_eq!(state.sessions.len().await, 1);

    // Second call reuses the session instead of connecting again
    let (status, _) = request_json(
        app,
        "POST",
        "/call-tool",
        Some(json!({"connectionId": format!("proxy_{HEX_ID}"), "toolName": "echo", "arguments": {}})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.sessions.len().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_bare_hex_connection_id_is_promoted() -> Result<()> {
    let port = spawn_downstream().await?;
    let state = state_with_downstream(port, None);

    let (status, body) = request_json(
        router(state),
        "POST",
        "/call-tool",
        Some(json!({"connectionId": HEX_ID, "toolName": "echo", "arguments": {}})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    Ok(())
}

#[tokio::test]
async fn test_call_tool_with_wallet_attaches_token_distribution() -> Result<()> {
    let port = spawn_downstream().await?;
    let state = state_with_downstream(port, Some(Arc::new(OkReward)));

    let (status, body) = request_json(
        router(state),
        "POST",
        "/call-tool",
        Some(json!({
            "connectionId": format!("proxy_{HEX_ID}"),
            "toolName": "echo",
            "arguments": {},
            "walletAddress": "0xwallet"
        })),
    )
    .await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["tokenDistribution"]["success"], true);
    assert_eq!(body["tokenDistribution"]["txHash"], "0xfeed");
    Ok(())
}

#[tokio::test]
async fn test_reward_failure_never_masks_tool_result() -> Result<()> {
    let port = spawn_downstream().await?;
    let state = state_with_downstream(port, Some(Arc::new(BrokenReward)));

    let (status, body) = request_json(
        router(state),
        "POST",
        "/call-tool",
        Some(json!({
            "connectionId": format!("proxy_{HEX_ID}"),
            "toolName": "echo",
            "arguments": {},
            "walletAddress": "0xwallet"
        })),
    )
    .await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["content"][0]["text"], "called echo");
    assert_eq!(body["tokenDistribution"]["success"], false);
    Ok(())
}

#[tokio::test]
async fn test_tools_listing_and_method_not_found_degradation() -> Result<()> {
    let port = spawn_downstream().await?;
    let state = state_with_downstream(port, None);
    let app = router(state);

    let (status, body) = request_json(app.clone(), "GET", &format!("/proxy/{HEX_ID}/tools"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["tools"][0]["name"], "echo");

    // A server without tools/list degrades to an empty list, not an error
    let (status, body) = request_json(app, "GET", &format!("/proxy/{BARE_ID}/tools"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["tools"], json!([]));
    assert!(body["message"]
        .as_str()
        .expect("message")
        .contains("does not implement tool listing"));
    Ok(())
}

#[tokio::test]
async fn test_sse_stream_opens_with_keep_alive() -> Result<()> {
    let port = spawn_downstream().await?;
    let state = state_with_downstream(port, None);
    let app = router(state.clone());

    let request = Request::builder()
        .method("GET")
        .uri(&format!("/proxy/{HEX_ID}/sse"))
        .header("accept", "text/event-stream")
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert!(content_type.starts_with("text/event-stream"));

    // Opening the stream created one session and bound its controller
    assert_eq!(state.sessions.len().await, 1);
    let session = state
        .sessions
        .find_latest_session_for(HEX_ID)
        .await
        .expect("session");
    assert!(session.has_controller());
    Ok(())
}

#[tokio::test]
async fn test_message_forwarding_and_config_mismatch() -> Result<()> {
    let port = spawn_downstream().await?;
    let state = state_with_downstream(port, None);
    let session = state.sessions.create_session(HEX_ID).await?;
    let app = router(state.clone());

    // Wrong config id in the path is rejected
    let (status, body) = request_json(
        app.clone(),
        "POST",
        "/proxy/otherconfig/message",
        Some(json!({"sessionId": session.session_id, "message": {"jsonrpc": "2.0", "id": 9, "method": "tools/list"}})),
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "ConfigMismatch");

    // Matching config id delivers to a guessed endpoint; the POST response
    // body is relayed into the session's event channel (queued, since no
    // browser is attached).
    let (status, body) = request_json(
        app,
        "POST",
        &format!("/proxy/{HEX_ID}/message"),
        Some(json!({"sessionId": session.session_id, "message": {"jsonrpc": "2.0", "id": 10, "method": "tools/list"}})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["message"].as_str().expect("status text").contains("delivered"));
    assert!(session.queued_len() >= 1);
    Ok(())
}
