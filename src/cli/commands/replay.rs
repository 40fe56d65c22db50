use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::app::{DispatchSettings, Fleet};
use crate::config::AppConfig;
use crate::decode::RawTelemetry;
use crate::ingest::{BatchSummary, IngestError};
use crate::model::now_ms;

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub summary: BatchSummary,
    /// Emergency workflows started for the escalations raised.
    pub workflows: usize,
}

/// Run NDJSON lines through an in-memory pipeline and wait for every
/// escalation to reach the orchestrator.
pub async fn replay_lines(config: &AppConfig, input: &str) -> Result<ReplayReport> {
    let dispatch = DispatchSettings {
        timeout: config.escalation.timeout(),
        dedup_window_ms: config.escalation.dedup_window_ms,
    };
    let (fleet, rx) = Fleet::in_memory(config.ingest.to_ingest_config(), dispatch);
    let worker = tokio::spawn(fleet.orchestrator.clone().run(rx));

    let arrived_at = now_ms();
    let batch: Vec<RawTelemetry> = input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| {
            RawTelemetry::json(line.to_string(), arrived_at).with_sequence((i + 1).to_string())
        })
        .collect();

    let result = fleet.ingestor.process_batch(batch).await;
    // Closing the queue lets the orchestrator drain and stop.
    drop(fleet);
    let workflows = worker.await.context("Orchestrator task failed")?;

    match result {
        Ok(summary) => Ok(ReplayReport { summary, workflows }),
        Err(IngestError::Escalation { summary, failures }) => anyhow::bail!(
            "{} of {} records failed to escalate",
            failures.len(),
            summary.processed
        ),
    }
}

pub async fn execute_replay(config_path: Option<&Path>, file: &Path, pretty: bool) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let input = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let report = replay_lines(&config, &input).await?;
    let output = if pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", output);
    Ok(())
}
