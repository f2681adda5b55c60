use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

/// Error types for the MCP protocol gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    // Classification errors (connect path)
    #[error("Connection script has no server URL (looked for `url`, `sse`, and `server.url`): {reason}")]
    InvalidScript { reason: String },

    #[error("Command transport requires an `args` array: {detail}")]
    MissingArgs { detail: String },

    #[error("'{url}' is not an MCP SSE endpoint: {reason}. Point the connection at the server's /sse (or /mcp) URL, not the page that embeds it.")]
    NotAnMcpEndpoint { url: String, reason: String },

    // Lookup errors
    #[error("No stored connection configuration for config id '{config_id}'")]
    ConfigNotFound { config_id: String },

    #[error("No direct connection registered under '{connection_id}'")]
    ConnectionNotFound { connection_id: String },

    #[error("Proxy session '{session_id}' not found (it may have been evicted)")]
    SessionNotFound { session_id: String },

    #[error("Session belongs to config '{expected}', not '{got}'")]
    ConfigMismatch { expected: String, got: String },

    // Downstream errors
    #[error("Failed to connect to downstream MCP server for config '{config_id}': {source}")]
    DownstreamConnectFailed {
        config_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to connect MCP server for connection '{connection_id}': {source}")]
    ConnectFailed {
        connection_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("All delivery strategies failed for session '{session_id}': {reason}")]
    ForwardFailed { session_id: String, reason: String },

    #[error("Downstream server does not implement tool listing")]
    ToolNotSupported,

    // Soft errors - reported alongside results, never surfaced as HTTP failures
    #[error("Reward workflow failed: {reason}")]
    RewardWorkflowFailed { reason: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl GatewayError {
    /// Short machine-readable code included in every error response.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidScript { .. } => "InvalidScript",
            GatewayError::MissingArgs { .. } => "MissingArgs",
            GatewayError::NotAnMcpEndpoint { .. } => "NotAnMcpEndpoint",
            GatewayError::ConfigNotFound { .. } => "ConfigNotFound",
            GatewayError::ConnectionNotFound { .. } => "ConnectionNotFound",
            GatewayError::SessionNotFound { .. } => "SessionNotFound",
            GatewayError::ConfigMismatch { .. } => "ConfigMismatch",
            GatewayError::DownstreamConnectFailed { .. } => "DownstreamConnectFailed",
            GatewayError::ConnectFailed { .. } => "ConnectFailed",
            GatewayError::ForwardFailed { .. } => "ForwardFailed",
            GatewayError::ToolNotSupported => "ToolNotSupported",
            GatewayError::RewardWorkflowFailed { .. } => "RewardWorkflowFailed",
            GatewayError::Internal { .. } => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidScript { .. }
            | GatewayError::MissingArgs { .. }
            | GatewayError::NotAnMcpEndpoint { .. } => StatusCode::BAD_REQUEST,
            GatewayError::ConfigNotFound { .. }
            | GatewayError::ConnectionNotFound { .. }
            | GatewayError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::ConfigMismatch { .. } => StatusCode::FORBIDDEN,
            GatewayError::DownstreamConnectFailed { .. }
            | GatewayError::ConnectFailed { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::ForwardFailed { .. }
            | GatewayError::ToolNotSupported
            | GatewayError::RewardWorkflowFailed { .. }
            | GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
