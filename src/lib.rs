// src/lib.rs
pub mod anomaly;
pub mod app;
pub mod broadcast;
pub mod cache;
pub mod cli;
pub mod config;
pub mod decode;
pub mod escalation;
pub mod ingest;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod server;
pub mod status;
pub mod store;

// Re-export tracing for use in other modules
pub use tracing;

pub use app::{Adapters, DispatchSettings, Fleet};
pub use bytes::Bytes;
pub use ingest::{BatchSummary, IngestConfig, IngestError, TelemetryIngestor};
pub use model::{TelemetryRecord, VehicleState};
pub use server::build_router;
