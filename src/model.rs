//! Telemetry domain types shared by the ingestion, detection and query paths.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Measure name used for every time-series point.
pub const MEASURE_NAME: &str = "vehicle_metrics";

/// Engine state reported by the vehicle. Unrecognized values map to `Unknown`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    On,
    Off,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Derived movement status stored with the latest vehicle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementStatus {
    Moving,
    Stopped,
}

/// One normalized observation of a vehicle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    #[serde(rename = "vehicleId")]
    pub vehicle_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cargo_temperature: Option<f64>,
    #[serde(default)]
    pub engine_status: EngineStatus,
}

impl TelemetryRecord {
    /// Speed with absence treated as zero.
    pub fn speed_or_zero(&self) -> f64 {
        self.speed.unwrap_or(0.0)
    }

    pub fn movement(&self) -> MovementStatus {
        if self.speed_or_zero() > 0.0 {
            MovementStatus::Moving
        } else {
            MovementStatus::Stopped
        }
    }
}

/// Latest known state of a vehicle, as held by the point store and the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub vehicle_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cargo_temperature: Option<f64>,
    #[serde(default)]
    pub engine_status: EngineStatus,
    pub status: MovementStatus,
    /// Expiry in epoch seconds.
    pub ttl: i64,
}

impl VehicleState {
    pub fn from_record(record: &TelemetryRecord, now_ms: i64, retention: Duration) -> Self {
        let ttl = now_ms.div_euclid(1000) + retention.as_secs() as i64;
        Self {
            vehicle_id: record.vehicle_id.clone(),
            timestamp: record.timestamp,
            location: record.location.clone(),
            speed: record.speed,
            direction: record.direction.clone(),
            cargo_temperature: record.cargo_temperature,
            engine_status: record.engine_status,
            status: record.movement(),
            ttl,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.ttl.saturating_mul(1000) <= now_ms
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

/// A named metric value. Values are decimal strings so the schema is stable
/// even when the source field was absent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureValue {
    pub name: String,
    pub value: String,
}

/// One multi-metric point appended to the time-series store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub time_ms: i64,
    pub dimensions: Vec<Dimension>,
    pub measure_name: String,
    pub measures: Vec<MeasureValue>,
}

impl TimeSeriesPoint {
    pub fn from_record(record: &TelemetryRecord, region: &str) -> Self {
        Self {
            time_ms: record.timestamp,
            dimensions: vec![
                Dimension {
                    name: "vehicle_id".to_string(),
                    value: record.vehicle_id.clone(),
                },
                Dimension {
                    name: "region".to_string(),
                    value: region.to_string(),
                },
            ],
            measure_name: MEASURE_NAME.to_string(),
            measures: vec![
                MeasureValue {
                    name: "speed".to_string(),
                    value: format_metric(record.speed),
                },
                MeasureValue {
                    name: "cargo_temperature".to_string(),
                    value: format_metric(record.cargo_temperature),
                },
            ],
        }
    }

    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value.as_str())
    }

    pub fn measure(&self, name: &str) -> Option<&str> {
        self.measures
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value.as_str())
    }
}

fn format_metric(value: Option<f64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "0".to_string())
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
