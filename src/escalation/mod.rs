//! Escalation of critical anomalies to the emergency workflow trigger.

mod dispatcher;
mod queue;

pub use dispatcher::{DispatchReceipt, EscalationDispatcher};
pub use queue::{EscalationReceiver, HttpEscalationQueue, MemoryEscalationQueue};

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::time::Duration;

use crate::anomaly::AnomalyEvent;
use crate::model::TelemetryRecord;

pub const CRITICAL_ANOMALY: &str = "critical_anomaly";
pub const CRITICAL_SEVERITY: &str = "critical";

/// Payload handed to the escalation trigger for one burst of high-severity
/// anomalies on one vehicle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationMessage {
    #[serde(rename = "vehicleId")]
    pub vehicle_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: String,
    pub anomalies: Vec<AnomalyEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<JsonValue>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap<String, JsonValue>,
    #[serde(
        rename = "dedupKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub dedup_key: Option<String>,
}

impl EscalationMessage {
    pub fn critical(record: &TelemetryRecord, anomalies: Vec<AnomalyEvent>, now_ms: i64) -> Self {
        Self {
            vehicle_id: record.vehicle_id.clone(),
            kind: CRITICAL_ANOMALY.to_string(),
            severity: CRITICAL_SEVERITY.to_string(),
            anomalies,
            location: record.location.clone(),
            timestamp: now_ms,
            metadata: JsonMap::new(),
            dedup_key: None,
        }
    }
}

/// Deduplication key for escalations of `vehicle_id` within the time bucket
/// containing `timestamp_ms`.
pub fn dedup_key(vehicle_id: &str, timestamp_ms: i64, window_ms: i64) -> String {
    format!(
        "{}-{}",
        vehicle_id,
        timestamp_ms.div_euclid(window_ms.max(1))
    )
}

/// One message addressed to an ordered partition of the trigger.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnqueueRequest {
    #[serde(rename = "groupId")]
    pub group_id: String,
    #[serde(rename = "dedupId", skip_serializing_if = "Option::is_none")]
    pub dedup_id: Option<String>,
    pub body: EscalationMessage,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("escalation enqueue timed out after {0:?}")]
    Timeout(Duration),
    #[error("escalation queue rejected message: {0}")]
    Rejected(String),
    #[error("escalation queue unreachable: {0}")]
    Network(String),
    #[error("failed to serialize escalation: {0}")]
    Serialize(String),
}

/// Asynchronous trigger ordered per partition (the vehicle identifier).
#[async_trait::async_trait]
pub trait EscalationQueue: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<(), DispatchError>;

    /// Whether the trigger honours `dedup_id`. When it does not, the
    /// dispatcher still sends and duplicate suppression is left downstream.
    fn supports_dedup(&self) -> bool {
        true
    }
}
