//! Frames exchanged with real-time clients.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Server to client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Connection registered.
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    /// Latest state of a subscribed vehicle.
    VehicleUpdate {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
        data: JsonValue,
    },
    Subscribed { vehicles: Vec<String> },
    Pong,
    Error { message: String },
}

impl WsMessage {
    pub fn vehicle_update(vehicle_id: impl Into<String>, data: JsonValue) -> Self {
        Self::VehicleUpdate {
            vehicle_id: vehicle_id.into(),
            data,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Client to server.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Subscribe {
        #[serde(rename = "vehicleIds", default)]
        vehicle_ids: Vec<String>,
    },
    Ping,
}
