use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Transport type of a stored connection configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Url,
    Command,
    Script,
}

/// A persisted connection configuration, keyed by config id.
///
/// The shape of `connection_config` depends on `connection_type`:
/// - `url`: `{"url": "https://host/sse"}`
/// - `command`: `{"command": "npx", "args": ["-y", "@pkg/server"]}`
/// - `script`: an arbitrary JSON blob (or a JSON string) carrying the
///   endpoint under `url`, `sse`, or `server.url`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredConnection {
    pub name: Option<String>,
    #[serde(rename = "connectionType")]
    pub connection_type: ConnectionType,
    #[serde(rename = "connectionConfig")]
    pub connection_config: Value,
}

/// Root structure of the connections file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionsFile {
    pub connections: HashMap<String, StoredConnection>,
}

/// Process-wide store of connection configurations.
///
/// The store itself is an external collaborator boundary: the gateway only
/// ever reads from it by config id. Cheap to clone; all clones share state.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStore {
    connections: Arc<RwLock<HashMap<String, StoredConnection>>>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the store from a JSON connections file. A missing file yields an
    /// empty store rather than an error, matching how the server boots in a
    /// fresh project.
    pub fn from_file(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(|| PathBuf::from("connections.json"));

        let parsed: ConnectionsFile = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            ConnectionsFile::default()
        };

        Ok(Self {
            connections: Arc::new(RwLock::new(parsed.connections)),
        })
    }

    pub fn get(&self, config_id: &str) -> Option<StoredConnection> {
        self.connections.read().ok()?.get(config_id).cloned()
    }

    pub fn contains(&self, config_id: &str) -> bool {
        self.connections
            .read()
            .map(|c| c.contains_key(config_id))
            .unwrap_or(false)
    }

    pub fn insert(&self, config_id: impl Into<String>, connection: StoredConnection) {
        if let Ok(mut connections) = self.connections.write() {
            connections.insert(config_id.into(), connection);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
