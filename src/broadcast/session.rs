use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ClientAction, WsMessage};
use crate::model::now_ms;
use crate::registry::{Connection, ConnectionRegistry, RegistryError};

/// Translates transport lifecycle events into registry operations.
#[derive(Clone)]
pub struct SessionHandler {
    registry: Arc<dyn ConnectionRegistry>,
}

impl SessionHandler {
    pub fn new(registry: Arc<dyn ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn connect(
        &self,
        connection_id: &str,
        user_id: Option<String>,
    ) -> Result<WsMessage, RegistryError> {
        info!(connection_id, user_id = ?user_id, "new connection");
        self.registry
            .connect(Connection::new(connection_id, user_id, now_ms()))
            .await?;
        Ok(WsMessage::Connected {
            connection_id: connection_id.to_string(),
        })
    }

    pub async fn disconnect(&self, connection_id: &str) -> Result<(), RegistryError> {
        info!(connection_id, "disconnecting");
        self.registry.disconnect(connection_id).await.map(|_| ())
    }

    /// Apply one client action and produce the reply frame.
    pub async fn apply(
        &self,
        connection_id: &str,
        action: ClientAction,
    ) -> Result<WsMessage, RegistryError> {
        match action {
            ClientAction::Ping => Ok(WsMessage::Pong),
            ClientAction::Subscribe { vehicle_ids } => {
                debug!(connection_id, vehicles = ?vehicle_ids, "subscribe");
                let set: BTreeSet<String> = vehicle_ids.into_iter().collect();
                let connection = self.registry.subscribe(connection_id, set, now_ms()).await?;
                Ok(WsMessage::Subscribed {
                    vehicles: connection.subscribed_vehicles.into_iter().collect(),
                })
            }
        }
    }

    /// Parse and apply a text frame. Failures become an error frame for the
    /// client rather than closing the socket.
    pub async fn handle_text(&self, connection_id: &str, text: &str) -> WsMessage {
        let action = match serde_json::from_str::<ClientAction>(text) {
            Ok(action) => action,
            Err(e) => {
                debug!(connection_id, error = %e, "unrecognized client frame");
                return WsMessage::Error {
                    message: "Unknown action".to_string(),
                };
            }
        };
        match self.apply(connection_id, action).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(connection_id, error = %e, "client action failed");
                WsMessage::Error {
                    message: e.to_string(),
                }
            }
        }
    }
}
