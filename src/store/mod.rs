//! Durable store ports: a point store holding the latest state per vehicle and
//! an append-only time-series store.

mod memory;

pub use memory::{MemoryPointStore, MemoryTimeSeriesStore};

use crate::model::{TimeSeriesPoint, VehicleState};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Latest-state store keyed by vehicle identifier.
#[async_trait::async_trait]
pub trait PointStore: Send + Sync {
    /// Replace any prior state for the vehicle.
    async fn put_latest(&self, state: VehicleState) -> Result<(), StoreError>;

    /// Most recent unexpired state, or `None`.
    async fn get_latest(&self, vehicle_id: &str) -> Result<Option<VehicleState>, StoreError>;
}

/// Append-only multi-metric store.
#[async_trait::async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn write_points(&self, points: Vec<TimeSeriesPoint>) -> Result<(), StoreError>;
}
