use crate::resolver::TransportSpec;
use crate::transport::Transport;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const METHOD_NOT_FOUND: i64 = -32601;

/// A tool advertised by a downstream MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Result of asking a downstream server for its tools
#[derive(Debug)]
pub enum ToolListing {
    Tools(Vec<Tool>),
    /// The server answered with method-not-found; treated as "no tools"
    /// rather than an error.
    Unsupported { message: String },
}

/// An MCP client bound to one downstream server.
///
/// The transport is serialized behind a mutex: stdio request/response is a
/// strict turn-taking protocol, and concurrent writers would interleave
/// frames.
#[derive(Debug)]
pub struct McpClient {
    transport: Mutex<Transport>,
    sse_url: Option<String>,
    stdio: bool,
}

impl McpClient {
    /// Connect the transport and run the MCP initialize handshake.
    ///
    /// SSE endpoints skip the initialize round trip: their sessions expire
    /// too quickly to survive one, and every server seen in practice
    /// answers tools/list without it.
    pub async fn connect(spec: &TransportSpec) -> Result<Self> {
        let mut transport = Transport::connect(spec).await?;
        let skip_handshake = matches!(spec, TransportSpec::Sse { url } if url.ends_with("/sse"));

        if !skip_handshake {
            let init_params = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": true }
                },
                "clientInfo": {
                    "name": "toolgate",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            });
            transport.request("initialize", init_params).await?;
            transport
                .notify("notifications/initialized", json!({}))
                .await?;
        }

        Ok(Self::from_transport(transport))
    }

    pub fn from_transport(transport: Transport) -> Self {
        let sse_url = transport.sse_url().map(|u| u.to_string());
        let stdio = transport.is_stdio();
        Self {
            transport: Mutex::new(transport),
            sse_url,
            stdio,
        }
    }

    /// SSE URL of the downstream server, when it has one
    pub fn sse_url(&self) -> Option<&str> {
        self.sse_url.as_deref()
    }

    /// Whether the transport has a native send path (stdio write)
    pub fn supports_native_send(&self) -> bool {
        self.stdio
    }

    /// Invoke a tool and return the complete JSON-RPC response. Downstream
    /// errors (method-not-found and friends) ride along verbatim; callers
    /// decide what to surface.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let params = json!({
            "name": name,
            "arguments": arguments,
        });
        let mut transport = self.transport.lock().await;
        transport.request("tools/call", params).await
    }

    /// List the downstream server's tools, degrading method-not-found to
    /// `ToolListing::Unsupported`.
    pub async fn list_tools(&self) -> Result<ToolListing> {
        let response = {
            let mut transport = self.transport.lock().await;
            transport.request("tools/list", json!({})).await?
        };

        if let Some(error) = response.get("error") {
            let code = error.get("code").and_then(|c| c.as_i64());
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("method not found")
                .to_string();
            if code == Some(METHOD_NOT_FOUND) {
                return Ok(ToolListing::Unsupported { message });
            }
            return Err(anyhow::anyhow!("tools/list failed: {message}"));
        }

        let tools = response
            .get("result")
            .and_then(|r| r.get("tools"))
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tool| serde_json::from_value(tool.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(ToolListing::Tools(tools))
    }

    /// Forward a caller-built JSON-RPC message over the live transport.
    pub async fn send_raw(&self, message: &Value) -> Result<Option<Value>> {
        let mut transport = self.transport.lock().await;
        transport.send_raw(message).await
    }
}
