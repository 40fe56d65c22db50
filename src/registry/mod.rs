//! Connection registry: live subscriber connections and the vehicles each one
//! wants updates for.

mod memory;

pub use memory::MemoryConnectionRegistry;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Connections live for 24 hours from creation; activity does not renew them.
pub const CONNECTION_TTL_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub subscribed_vehicles: BTreeSet<String>,
    pub connected_at: i64,
    pub expires_at: i64,
}

impl Connection {
    pub fn new(connection_id: impl Into<String>, user_id: Option<String>, now_ms: i64) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id,
            subscribed_vehicles: BTreeSet::new(),
            connected_at: now_ms,
            expires_at: now_ms + CONNECTION_TTL_MS,
        }
    }

    pub fn is_live(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at
    }

    pub fn is_subscribed_to(&self, vehicle_id: &str) -> bool {
        self.subscribed_vehicles.contains(vehicle_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} not found")]
    NotFound(String),
    #[error("registry persistence failed: {0}")]
    Persist(String),
}

/// Concurrency-safe keyed store of connections with per-entry atomic
/// replace and delete.
#[async_trait::async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Store a new connection, replacing any entry under the same id.
    async fn connect(&self, connection: Connection) -> Result<(), RegistryError>;

    /// Replace the subscribed set of a live connection wholesale.
    async fn subscribe(
        &self,
        connection_id: &str,
        vehicle_ids: BTreeSet<String>,
        now_ms: i64,
    ) -> Result<Connection, RegistryError>;

    /// Remove a connection. Returns whether an entry existed.
    async fn disconnect(&self, connection_id: &str) -> Result<bool, RegistryError>;

    async fn get(&self, connection_id: &str) -> Result<Option<Connection>, RegistryError>;

    /// Ids of live connections subscribed to `vehicle_id`.
    async fn subscribers_of(
        &self,
        vehicle_id: &str,
        now_ms: i64,
    ) -> Result<Vec<String>, RegistryError>;
}
