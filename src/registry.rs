use crate::client::McpClient;
use crate::errors::{GatewayError, GatewayResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Process-wide map of direct (non-proxied) MCP connections.
///
/// Constructed once at the composition root and injected into handlers
/// through server state, so tests can substitute an isolated instance.
/// Cheap to clone; all clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, Arc<McpClient>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, connection_id: impl Into<String>, client: Arc<McpClient>) {
        let connection_id = connection_id.into();
        println!("🔗 Registered direct connection: {connection_id}");
        self.connections.write().await.insert(connection_id, client);
    }

    pub async fn get(&self, connection_id: &str) -> GatewayResult<Arc<McpClient>> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| GatewayError::ConnectionNotFound {
                connection_id: connection_id.to_string(),
            })
    }

    pub async fn remove(&self, connection_id: &str) -> bool {
        self.connections.write().await.remove(connection_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
