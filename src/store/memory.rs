use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{PointStore, StoreError, TimeSeriesStore};
use crate::model::{now_ms, TimeSeriesPoint, VehicleState};

/// In-memory point store. Expired items are hidden from readers.
#[derive(Default)]
pub struct MemoryPointStore {
    items: RwLock<HashMap<String, VehicleState>>,
}

impl MemoryPointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Drop expired items, returning how many were removed.
    pub async fn purge_expired(&self, now_ms: i64) -> usize {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|_, state| !state.is_expired(now_ms));
        before - items.len()
    }
}

#[async_trait::async_trait]
impl PointStore for MemoryPointStore {
    async fn put_latest(&self, state: VehicleState) -> Result<(), StoreError> {
        let mut items = self.items.write().await;
        items.insert(state.vehicle_id.clone(), state);
        Ok(())
    }

    async fn get_latest(&self, vehicle_id: &str) -> Result<Option<VehicleState>, StoreError> {
        let items = self.items.read().await;
        let now = now_ms();
        Ok(items
            .get(vehicle_id)
            .filter(|state| !state.is_expired(now))
            .cloned())
    }
}

/// In-memory time-series store. Points accumulate; nothing is deduplicated.
#[derive(Default)]
pub struct MemoryTimeSeriesStore {
    points: RwLock<Vec<TimeSeriesPoint>>,
}

impl MemoryTimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn points(&self) -> Vec<TimeSeriesPoint> {
        self.points.read().await.clone()
    }

    pub async fn points_for(&self, vehicle_id: &str) -> Vec<TimeSeriesPoint> {
        self.points
            .read()
            .await
            .iter()
            .filter(|p| p.dimension("vehicle_id") == Some(vehicle_id))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl TimeSeriesStore for MemoryTimeSeriesStore {
    async fn write_points(&self, points: Vec<TimeSeriesPoint>) -> Result<(), StoreError> {
        self.points.write().await.extend(points);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EngineStatus, MovementStatus};

    fn state(vehicle_id: &str, timestamp: i64, ttl: i64) -> VehicleState {
        VehicleState {
            vehicle_id: vehicle_id.to_string(),
            timestamp,
            location: None,
            speed: Some(10.0),
            direction: None,
            cargo_temperature: None,
            engine_status: EngineStatus::On,
            status: MovementStatus::Moving,
            ttl,
        }
    }

    fn far_future() -> i64 {
        now_ms() / 1000 + 3600
    }

    #[tokio::test]
    async fn put_replaces_prior_state() {
        let store = MemoryPointStore::new();
        store.put_latest(state("V1", 1, far_future())).await.unwrap();
        store.put_latest(state("V1", 2, far_future())).await.unwrap();

        let latest = store.get_latest("V1").await.unwrap().unwrap();
        assert_eq!(latest.timestamp, 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn expired_state_is_not_returned() {
        let store = MemoryPointStore::new();
        store.put_latest(state("V1", 1, 1)).await.unwrap();
        assert!(store.get_latest("V1").await.unwrap().is_none());
        assert_eq!(store.purge_expired(now_ms()).await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_vehicle_is_none() {
        let store = MemoryPointStore::new();
        assert!(store.get_latest("nope").await.unwrap().is_none());
    }
}
