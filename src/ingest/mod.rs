//! Batch ingestion: decode, persist, then hand each record to detection and
//! fan-out.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::anomaly::{AnomalyDetector, DetectionReport};
use crate::broadcast::BroadcastFanout;
use crate::decode::{decode_record, RawTelemetry};
use crate::escalation::DispatchError;
use crate::model::{now_ms, TelemetryRecord, TimeSeriesPoint, VehicleState};
use crate::store::{PointStore, TimeSeriesStore};

const DEFAULT_RETENTION: Duration = Duration::from_secs(90 * 24 * 60 * 60);

#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// Records processed at once within a batch.
    pub concurrency: usize,
    /// Value of the `region` dimension on time-series points.
    pub region: String,
    /// Point-store expiry, from ingestion time.
    pub retention: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            region: "us-east-1".to_string(),
            retention: DEFAULT_RETENTION,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Decode,
    Persist,
}

enum RecordOutcome {
    Processed {
        vehicle_id: String,
        detection: Result<DetectionReport, DispatchError>,
        delivered: usize,
    },
    Skipped(SkipReason),
}

/// Result of one batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    /// Vehicle ids of processed records, in batch order.
    pub vehicles: Vec<String>,
    pub skipped: usize,
    pub anomalies: usize,
    pub escalations: usize,
    pub deliveries: usize,
}

#[derive(Debug)]
pub struct EscalationFailure {
    pub vehicle_id: String,
    pub error: DispatchError,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Records were persisted but at least one critical escalation could not
    /// be enqueued. The caller should redeliver the batch.
    #[error("{} escalation(s) failed to dispatch", .failures.len())]
    Escalation {
        summary: BatchSummary,
        failures: Vec<EscalationFailure>,
    },
}

pub struct TelemetryIngestor {
    points: Arc<dyn PointStore>,
    series: Arc<dyn TimeSeriesStore>,
    detector: AnomalyDetector,
    fanout: BroadcastFanout,
    config: IngestConfig,
}

impl TelemetryIngestor {
    pub fn new(
        points: Arc<dyn PointStore>,
        series: Arc<dyn TimeSeriesStore>,
        detector: AnomalyDetector,
        fanout: BroadcastFanout,
        config: IngestConfig,
    ) -> Self {
        Self {
            points,
            series,
            detector,
            fanout,
            config,
        }
    }

    /// Process every record in the batch. Undecodable or unpersistable
    /// records are skipped; the batch never aborts. Records for different
    /// vehicles run concurrently, records for the same vehicle run one after
    /// another in batch order. Escalation failures are reported after all
    /// records settle.
    #[tracing::instrument(
        name = "ingest_batch",
        skip(self, batch),
        fields(batch_size = batch.len(), processed = tracing::field::Empty)
    )]
    pub async fn process_batch(
        &self,
        batch: Vec<RawTelemetry>,
    ) -> Result<BatchSummary, IngestError> {
        let concurrency = self.config.concurrency.max(1);

        let mut outcomes: Vec<(usize, RecordOutcome)> = Vec::with_capacity(batch.len());
        let mut lanes: Vec<Vec<(usize, TelemetryRecord)>> = Vec::new();
        let mut lane_of: HashMap<String, usize> = HashMap::new();
        for (index, raw) in batch.into_iter().enumerate() {
            match decode_record(&raw, now_ms()) {
                Ok(record) => {
                    let lane = *lane_of.entry(record.vehicle_id.clone()).or_insert_with(|| {
                        lanes.push(Vec::new());
                        lanes.len() - 1
                    });
                    lanes[lane].push((index, record));
                }
                Err(e) => {
                    warn!(
                        sequence = ?raw.arrival.sequence,
                        error = %e,
                        "skipping undecodable record"
                    );
                    outcomes.push((index, RecordOutcome::Skipped(SkipReason::Decode)));
                }
            }
        }

        let settled: Vec<Vec<(usize, RecordOutcome)>> = stream::iter(lanes)
            .map(|lane| self.process_lane(lane))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        outcomes.extend(settled.into_iter().flatten());
        outcomes.sort_by_key(|(index, _)| *index);

        let mut summary = BatchSummary::default();
        let mut failures = Vec::new();
        for (_, outcome) in outcomes {
            match outcome {
                RecordOutcome::Processed {
                    vehicle_id,
                    detection,
                    delivered,
                } => {
                    summary.processed += 1;
                    summary.deliveries += delivered;
                    match detection {
                        Ok(report) => {
                            summary.anomalies += report.anomalies.len();
                            if report.escalated {
                                summary.escalations += 1;
                            }
                        }
                        Err(error) => failures.push(EscalationFailure {
                            vehicle_id: vehicle_id.clone(),
                            error,
                        }),
                    }
                    summary.vehicles.push(vehicle_id);
                }
                RecordOutcome::Skipped(reason) => {
                    debug!(?reason, "record skipped");
                    summary.skipped += 1;
                }
            }
        }

        tracing::Span::current().record("processed", summary.processed);
        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            anomalies = summary.anomalies,
            escalations = summary.escalations,
            "batch ingested"
        );

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(IngestError::Escalation { summary, failures })
        }
    }

    /// Records of one vehicle, strictly in order.
    async fn process_lane(
        &self,
        lane: Vec<(usize, TelemetryRecord)>,
    ) -> Vec<(usize, RecordOutcome)> {
        let mut outcomes = Vec::with_capacity(lane.len());
        for (index, record) in lane {
            outcomes.push((index, self.process_record(record).await));
        }
        outcomes
    }

    async fn process_record(&self, record: TelemetryRecord) -> RecordOutcome {
        let now = now_ms();
        let state = VehicleState::from_record(&record, now, self.config.retention);
        let update = match serde_json::to_value(&state) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    vehicle_id = %record.vehicle_id,
                    error = %e,
                    "skipping unserializable record"
                );
                return RecordOutcome::Skipped(SkipReason::Persist);
            }
        };
        let point = TimeSeriesPoint::from_record(&record, &self.config.region);

        let (latest, series) = futures::join!(
            self.points.put_latest(state),
            self.series.write_points(vec![point])
        );
        let mut persisted = true;
        if let Err(e) = latest {
            warn!(vehicle_id = %record.vehicle_id, error = %e, "point store write failed");
            persisted = false;
        }
        if let Err(e) = series {
            warn!(vehicle_id = %record.vehicle_id, error = %e, "time-series write failed");
            persisted = false;
        }
        if !persisted {
            return RecordOutcome::Skipped(SkipReason::Persist);
        }

        let (detection, broadcast) = futures::join!(
            self.detector.evaluate(&record, now),
            self.fanout.broadcast(&record.vehicle_id, &update, now)
        );

        RecordOutcome::Processed {
            vehicle_id: record.vehicle_id,
            detection,
            delivered: broadcast.delivered,
        }
    }
}
