use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{Connection, ConnectionRegistry, RegistryError};
use crate::model::now_ms;

/// In-memory registry, optionally mirrored to a JSON snapshot file so that
/// connections survive a process restart.
///
/// A change whose snapshot write fails is rolled back, except removals.
#[derive(Default)]
pub struct MemoryConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
    snapshot: Option<PathBuf>,
    /// Held while writing the snapshot file, never together with a map write.
    writer: Mutex<()>,
}

impl MemoryConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a registry backed by `path`. Entries already expired at load time
    /// are dropped.
    pub async fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let connections = load_snapshot(&path, now_ms()).await?;
        info!(
            path = %path.display(),
            connections = connections.len(),
            "connection registry loaded"
        );
        Ok(Self {
            connections: RwLock::new(connections),
            snapshot: Some(path),
            writer: Mutex::new(()),
        })
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Remove entries past their expiry.
    pub async fn purge_expired(&self, now_ms: i64) -> Result<usize, RegistryError> {
        let removed = {
            let mut connections = self.connections.write().await;
            let before = connections.len();
            connections.retain(|_, c| c.is_live(now_ms));
            before - connections.len()
        };
        if removed > 0 {
            self.persist().await?;
            debug!(removed, "expired connections purged");
        }
        Ok(removed)
    }

    /// Write the current map to the snapshot file. The map is copied under a
    /// read lock taken after the writer lock, so the last write always holds
    /// the newest state.
    async fn persist(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let _writer = self.writer.lock().await;

        let body = {
            let connections = self.connections.read().await;
            let mut entries: Vec<&Connection> = connections.values().collect();
            entries.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
            serde_json::to_vec_pretty(&entries)
                .map_err(|e| RegistryError::Persist(e.to_string()))?
        };

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| RegistryError::Persist(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| RegistryError::Persist(format!("{}: {}", path.display(), e)))
    }

    /// Undo `written` unless another writer has replaced it since.
    async fn roll_back(&self, written: &Connection, previous: Option<Connection>) {
        let mut connections = self.connections.write().await;
        if connections.get(&written.connection_id) != Some(written) {
            return;
        }
        warn!(connection_id = %written.connection_id, "rolling back unpersisted change");
        match previous {
            Some(previous) => {
                connections.insert(previous.connection_id.clone(), previous);
            }
            None => {
                connections.remove(&written.connection_id);
            }
        }
    }
}

async fn load_snapshot(
    path: &Path,
    now_ms: i64,
) -> Result<HashMap<String, Connection>, RegistryError> {
    let body = match tokio::fs::read(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(RegistryError::Persist(format!("{}: {}", path.display(), e))),
    };

    let entries: Vec<Connection> = serde_json::from_slice(&body)
        .map_err(|e| RegistryError::Persist(format!("{}: {}", path.display(), e)))?;

    Ok(entries
        .into_iter()
        .filter(|c| c.is_live(now_ms))
        .map(|c| (c.connection_id.clone(), c))
        .collect())
}

#[async_trait::async_trait]
impl ConnectionRegistry for MemoryConnectionRegistry {
    async fn connect(&self, connection: Connection) -> Result<(), RegistryError> {
        let previous = self
            .connections
            .write()
            .await
            .insert(connection.connection_id.clone(), connection.clone());
        if let Err(e) = self.persist().await {
            self.roll_back(&connection, previous).await;
            return Err(e);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        connection_id: &str,
        vehicle_ids: BTreeSet<String>,
        now_ms: i64,
    ) -> Result<Connection, RegistryError> {
        let (previous, updated) = {
            let mut connections = self.connections.write().await;
            let connection = connections
                .get_mut(connection_id)
                .filter(|c| c.is_live(now_ms))
                .ok_or_else(|| RegistryError::NotFound(connection_id.to_string()))?;
            let previous = connection.clone();
            connection.subscribed_vehicles = vehicle_ids;
            (previous, connection.clone())
        };
        if let Err(e) = self.persist().await {
            self.roll_back(&updated, Some(previous)).await;
            return Err(e);
        }
        Ok(updated)
    }

    async fn disconnect(&self, connection_id: &str) -> Result<bool, RegistryError> {
        let removed = self.connections.write().await.remove(connection_id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn get(&self, connection_id: &str) -> Result<Option<Connection>, RegistryError> {
        Ok(self.connections.read().await.get(connection_id).cloned())
    }

    async fn subscribers_of(
        &self,
        vehicle_id: &str,
        now_ms: i64,
    ) -> Result<Vec<String>, RegistryError> {
        let connections = self.connections.read().await;
        Ok(connections
            .values()
            .filter(|c| c.is_live(now_ms) && c.is_subscribed_to(vehicle_id))
            .map(|c| c.connection_id.clone())
            .collect())
    }
}
