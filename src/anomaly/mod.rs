//! Rule-based anomaly detection over single telemetry records.
//!
//! Rules are evaluated in a fixed order and independently; one record may
//! trigger several. Only high-severity anomalies are escalated, and all of a
//! record's high anomalies travel together in a single escalation.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::escalation::{DispatchError, EscalationDispatcher, EscalationMessage};
use crate::model::{EngineStatus, TelemetryRecord};

pub const SPEED_LIMIT: f64 = 120.0;
pub const CARGO_TEMPERATURE_LIMIT: f64 = 30.0;
const LONG_IDLE_MESSAGE: &str = "Vehicle idle with engine running";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    ExcessiveSpeed,
    HighTemperature,
    LongIdle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A classified rule match for one record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "vehicleId")]
    pub vehicle_id: String,
    #[serde(rename = "recordTimestamp")]
    pub record_timestamp: i64,
}

impl AnomalyEvent {
    fn new(record: &TelemetryRecord, kind: AnomalyKind, severity: Severity) -> Self {
        Self {
            kind,
            severity,
            value: None,
            threshold: None,
            message: None,
            vehicle_id: record.vehicle_id.clone(),
            record_timestamp: record.timestamp,
        }
    }

    fn measured(mut self, value: f64, threshold: f64) -> Self {
        self.value = Some(value);
        self.threshold = Some(threshold);
        self
    }

    pub fn is_high(&self) -> bool {
        self.severity == Severity::High
    }
}

/// Evaluate the fixed rule set. Output order is rule order.
///
/// Rules only fire on values that were actually reported: an absent speed
/// neither exceeds the limit nor counts as idling.
pub fn detect(record: &TelemetryRecord) -> Vec<AnomalyEvent> {
    let mut anomalies = Vec::new();

    if let Some(speed) = record.speed.filter(|s| *s > SPEED_LIMIT) {
        anomalies.push(
            AnomalyEvent::new(record, AnomalyKind::ExcessiveSpeed, Severity::High)
                .measured(speed, SPEED_LIMIT),
        );
    }

    if let Some(temperature) = record
        .cargo_temperature
        .filter(|t| *t > CARGO_TEMPERATURE_LIMIT)
    {
        anomalies.push(
            AnomalyEvent::new(record, AnomalyKind::HighTemperature, Severity::Medium)
                .measured(temperature, CARGO_TEMPERATURE_LIMIT),
        );
    }

    if record.speed == Some(0.0) && record.engine_status == EngineStatus::On {
        let mut idle = AnomalyEvent::new(record, AnomalyKind::LongIdle, Severity::Low);
        idle.message = Some(LONG_IDLE_MESSAGE.to_string());
        anomalies.push(idle);
    }

    anomalies
}

/// Everything detected for one record, plus whether it was escalated.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionReport {
    #[serde(rename = "vehicleId")]
    pub vehicle_id: String,
    pub anomalies: Vec<AnomalyEvent>,
    pub escalated: bool,
}

impl DetectionReport {
    pub fn high_count(&self) -> usize {
        self.anomalies.iter().filter(|a| a.is_high()).count()
    }
}

/// Runs the rule set and hands high-severity findings to the dispatcher.
pub struct AnomalyDetector {
    dispatcher: EscalationDispatcher,
}

impl AnomalyDetector {
    pub fn new(dispatcher: EscalationDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Detect anomalies and escalate the high subset, if any.
    ///
    /// A dispatch failure is returned as an error; the anomalies themselves are
    /// logged before dispatch so they are never silently lost.
    pub async fn evaluate(
        &self,
        record: &TelemetryRecord,
        now_ms: i64,
    ) -> Result<DetectionReport, DispatchError> {
        let anomalies = detect(record);
        let critical: Vec<AnomalyEvent> =
            anomalies.iter().filter(|a| a.is_high()).cloned().collect();

        if anomalies.is_empty() {
            debug!(vehicle_id = %record.vehicle_id, "no anomalies");
        } else {
            info!(
                vehicle_id = %record.vehicle_id,
                anomalies = anomalies.len(),
                critical = critical.len(),
                "anomalies detected"
            );
        }

        let escalated = !critical.is_empty();
        if escalated {
            let message = EscalationMessage::critical(record, critical, now_ms);
            self.dispatcher.dispatch(message).await?;
        }

        Ok(DetectionReport {
            vehicle_id: record.vehicle_id.clone(),
            anomalies,
            escalated,
        })
    }
}
