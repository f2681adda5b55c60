// MCP protocol gateway: bridges browser tool-call requests to MCP servers
// over stdio and SSE transports, with proxy sessions surviving across
// transport shapes.

// Comprehensive error handling system
pub mod errors;

// Connection configuration store (external collaborator boundary)
pub mod config;

// Connect-request classification
pub mod resolver;

// Downstream channels and the MCP client on top of them
pub mod transport;
pub mod client;

// Process-wide registries
pub mod registry;
pub mod session;

// Best-effort message delivery
pub mod forwarder;

// Tool invocation and the reward collaborator boundary
pub mod orchestrator;
pub mod reward;

// HTTP surface
pub mod server;

// Re-export key types for convenience
pub use client::{McpClient, Tool, ToolListing};
pub use config::{ConnectionStore, ConnectionType, StoredConnection};
pub use errors::{GatewayError, GatewayResult};
pub use forwarder::{DeliveryOutcome, DeliveryRoute, MessageForwarder};
pub use orchestrator::{Classification, Orchestrator, ToolCallOutcome};
pub use registry::ConnectionRegistry;
pub use resolver::{ConnectRequest, Resolved, TransportSpec};
pub use reward::{HttpRewardWorkflow, RewardWorkflow};
pub use session::{ProxySession, SessionKind, SessionManager};
pub use server::GatewayState;
