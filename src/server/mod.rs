pub mod http_server;

pub use http_server::{router, serve, GatewayState};
