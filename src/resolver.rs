use crate::config::{ConnectionType, StoredConnection};
use crate::errors::{GatewayError, GatewayResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

/// A connect request as sent by the browser. Exactly one of `url`,
/// `command`, or `script` is expected; `connection_id` is the caller's
/// preferred id and may be overridden by an id embedded in the script.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConnectRequest {
    pub url: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub script: Option<Value>,
    #[serde(rename = "connectionId")]
    pub connection_id: Option<String>,
}

/// Normalized description of how to reach a downstream MCP server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    Stdio { command: String, args: Vec<String> },
    Sse { url: String },
}

/// Outcome of classifying a connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Connect directly from this process
    Direct {
        spec: TransportSpec,
        /// Id the script embedded, overriding the caller-supplied one
        connection_id_override: Option<String>,
    },
    /// The URL points back at this gateway's own proxy endpoint; route to
    /// the session manager instead of opening an outbound connection.
    Proxy { config_id: String },
}

// Matches the gateway's own SSE endpoint in both absolute and relative
// forms, e.g. "http://host/api/proxy/abc123/sse" or "/api/proxy/abc123/sse".
static GATEWAY_SSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/api/proxy/([^/?#]+)/sse/?(?:[?#].*)?$").expect("gateway SSE pattern")
});

/// Classify a connect request into a direct transport or the proxy path.
///
/// Rule order matters: scripts first, then the self-referential gateway
/// pattern (before generic URL handling, so a gateway URL is never treated
/// as an ordinary remote SSE endpoint), then plain http(s) URLs, then
/// command lines.
pub fn resolve(request: &ConnectRequest) -> GatewayResult<Resolved> {
    if let Some(script) = &request.script {
        let (spec, id_override) = resolve_script(script)?;
        return Ok(Resolved::Direct {
            spec,
            connection_id_override: id_override,
        });
    }

    if let Some(url) = &request.url {
        if let Some(config_id) = gateway_config_id(url) {
            return Ok(Resolved::Proxy { config_id });
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            ensure_mcp_endpoint(url)?;
            return Ok(Resolved::Direct {
                spec: TransportSpec::Sse { url: url.clone() },
                connection_id_override: None,
            });
        }
    }

    // Anything left is treated as a command line; `url` doubles as the
    // command when `command` is absent.
    let command = request
        .command
        .clone()
        .or_else(|| request.url.clone())
        .ok_or_else(|| GatewayError::MissingArgs {
            detail: "request carries no url, command, or script".to_string(),
        })?;
    let args = request.args.clone().ok_or_else(|| GatewayError::MissingArgs {
        detail: format!("command '{command}' was given without args"),
    })?;

    Ok(Resolved::Direct {
        spec: TransportSpec::Stdio { command, args },
        connection_id_override: None,
    })
}

/// Extract the config id when the URL matches this gateway's own
/// `/api/proxy/<configId>/sse` pattern.
pub fn gateway_config_id(url: &str) -> Option<String> {
    GATEWAY_SSE_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parse a connection script (a JSON object, or a string holding JSON) and
/// extract the server endpoint plus any embedded connection id.
pub fn resolve_script(script: &Value) -> GatewayResult<(TransportSpec, Option<String>)> {
    let parsed: Value = match script {
        Value::String(raw) => {
            serde_json::from_str(raw).map_err(|e| GatewayError::InvalidScript {
                reason: format!("script string is not valid JSON: {e}"),
            })?
        }
        other => other.clone(),
    };

    let endpoint = parsed
        .get("url")
        .and_then(|v| v.as_str())
        .or_else(|| parsed.get("sse").and_then(|v| v.as_str()))
        .or_else(|| {
            parsed
                .get("server")
                .and_then(|s| s.get("url"))
                .and_then(|v| v.as_str())
        })
        .ok_or_else(|| GatewayError::InvalidScript {
            reason: "script carries no endpoint".to_string(),
        })?
        .to_string();

    let id_override = parsed
        .get("connectionId")
        .and_then(|v| v.as_str())
        .or_else(|| parsed.get("id").and_then(|v| v.as_str()))
        .map(|s| s.to_string());

    Ok((TransportSpec::Sse { url: endpoint }, id_override))
}

/// Build a transport spec from a stored connection configuration. Scripts
/// are re-parsed exactly the way connect-time scripts are.
pub fn resolve_stored(stored: &StoredConnection) -> GatewayResult<TransportSpec> {
    match stored.connection_type {
        ConnectionType::Url => {
            let url = stored
                .connection_config
                .get("url")
                .and_then(|v| v.as_str())
                .ok_or_else(|| GatewayError::InvalidScript {
                    reason: "stored url connection has no `url` field".to_string(),
                })?;
            Ok(TransportSpec::Sse {
                url: url.to_string(),
            })
        }
        ConnectionType::Command => {
            let command = stored
                .connection_config
                .get("command")
                .and_then(|v| v.as_str())
                .ok_or_else(|| GatewayError::MissingArgs {
                    detail: "stored command connection has no `command` field".to_string(),
                })?
                .to_string();
            let args = stored
                .connection_config
                .get("args")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|a| a.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .ok_or_else(|| GatewayError::MissingArgs {
                    detail: format!("stored command '{command}' has no args array"),
                })?;
            Ok(TransportSpec::Stdio { command, args })
        }
        ConnectionType::Script => {
            let (spec, _) = resolve_script(&stored.connection_config)?;
            Ok(spec)
        }
    }
}

/// Fail fast when a URL looks like a frontend page rather than an MCP SSE
/// endpoint. Connecting anyway would only surface much later as a confusing
/// "invalid content-type" deep inside the transport.
fn ensure_mcp_endpoint(url: &str) -> GatewayResult<()> {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    let after_host = without_scheme.find('/').map(|i| &without_scheme[i..]);
    let (path, query) = match after_host {
        Some(rest) => match rest.split_once('?') {
            Some((p, q)) => (p, q),
            None => (rest, ""),
        },
        None => ("", without_scheme.split_once('?').map(|(_, q)| q).unwrap_or("")),
    };

    if query.split('&').any(|pair| pair.starts_with("configId=")) {
        return Err(GatewayError::NotAnMcpEndpoint {
            url: url.to_string(),
            reason: "URL carries a configId query parameter, which marks a frontend page"
                .to_string(),
        });
    }

    if path.is_empty() || path == "/" {
        return Err(GatewayError::NotAnMcpEndpoint {
            url: url.to_string(),
            reason: "URL points at a site root, which serves a frontend page".to_string(),
        });
    }

    if !path.contains("/sse") && !path.contains("/mcp") && !path.contains("/api") {
        return Err(GatewayError::NotAnMcpEndpoint {
            url: url.to_string(),
            reason: "path has no /sse, /mcp, or /api segment, so it almost certainly serves a frontend page"
                .to_string(),
        });
    }

    Ok(())
}
