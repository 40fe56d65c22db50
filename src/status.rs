//! Read path for current vehicle state: cache first, then the point store.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::model::VehicleState;
use crate::store::{PointStore, StoreError};

/// How long a state read from the store is served from cache.
pub const CACHE_TTL: Duration = Duration::from_secs(30);

pub fn cache_key(vehicle_id: &str) -> String {
    format!("vehicle:{}", vehicle_id)
}

/// Read-through status lookups.
///
/// Ingestion never invalidates the cache, so a cached state may trail the
/// store by up to [`CACHE_TTL`]. Absent vehicles are not cached.
#[derive(Clone)]
pub struct StatusQueryService {
    cache: Arc<dyn Cache>,
    store: Arc<dyn PointStore>,
}

impl StatusQueryService {
    pub fn new(cache: Arc<dyn Cache>, store: Arc<dyn PointStore>) -> Self {
        Self { cache, store }
    }

    #[tracing::instrument(name = "status_get", skip(self))]
    pub async fn get(&self, vehicle_id: &str) -> Result<Option<VehicleState>, StoreError> {
        let key = cache_key(vehicle_id);

        match self.cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<VehicleState>(&cached) {
                Ok(state) => {
                    debug!("cache hit");
                    return Ok(Some(state));
                }
                Err(e) => warn!(error = %e, "discarding unreadable cache entry"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "cache read failed, falling back to store"),
        }

        let Some(state) = self.store.get_latest(vehicle_id).await? else {
            return Ok(None);
        };

        match serde_json::to_string(&state) {
            Ok(serialized) => {
                if let Err(e) = self.cache.set_ex(&key, serialized, CACHE_TTL).await {
                    warn!(error = %e, "cache write failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize state for cache"),
        }

        Ok(Some(state))
    }

    /// Store lookups for each id, in request order. Missing ids are omitted.
    pub async fn batch_get(&self, vehicle_ids: &[String]) -> Result<Vec<VehicleState>, StoreError> {
        let lookups = vehicle_ids.iter().map(|id| self.store.get_latest(id));
        let results = futures::future::try_join_all(lookups).await?;
        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, MemoryCache};
    use crate::model::{now_ms, EngineStatus, TelemetryRecord};
    use crate::store::MemoryPointStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn state(vehicle_id: &str, speed: f64) -> VehicleState {
        let record = TelemetryRecord {
            vehicle_id: vehicle_id.to_string(),
            timestamp: now_ms(),
            location: None,
            speed: Some(speed),
            direction: None,
            cargo_temperature: None,
            engine_status: EngineStatus::On,
        };
        VehicleState::from_record(&record, now_ms(), Duration::from_secs(90 * 86_400))
    }

    /// Point store that counts reads and can be taken offline.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryPointStore,
        reads: AtomicUsize,
        offline: AtomicBool,
    }

    #[async_trait::async_trait]
    impl PointStore for CountingStore {
        async fn put_latest(&self, state: VehicleState) -> Result<(), StoreError> {
            self.inner.put_latest(state).await
        }

        async fn get_latest(&self, vehicle_id: &str) -> Result<Option<VehicleState>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            self.inner.get_latest(vehicle_id).await
        }
    }

    struct BrokenCache;

    #[async_trait::async_trait]
    impl Cache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }

        async fn set_ex(
            &self,
            _key: &str,
            _value: String,
            _ttl: Duration,
        ) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cached_state_is_served_for_thirty_seconds() {
        let store = Arc::new(CountingStore::default());
        let service = StatusQueryService::new(Arc::new(MemoryCache::new()), store.clone());

        store.put_latest(state("T1", 10.0)).await.unwrap();
        assert_eq!(service.get("T1").await.unwrap().unwrap().speed, Some(10.0));

        // Newer state lands in the store but the cache still answers.
        store.put_latest(state("T1", 55.0)).await.unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(service.get("T1").await.unwrap().unwrap().speed, Some(10.0));
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(service.get("T1").await.unwrap().unwrap().speed, Some(55.0));
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_state_outlives_a_store_outage() {
        let store = Arc::new(CountingStore::default());
        let service = StatusQueryService::new(Arc::new(MemoryCache::new()), store.clone());

        store.put_latest(state("T1", 42.0)).await.unwrap();
        assert_eq!(service.get("T1").await.unwrap().unwrap().speed, Some(42.0));

        store.offline.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(29)).await;
        let cached = service.get("T1").await.unwrap().unwrap();
        assert_eq!(cached.speed, Some(42.0));
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let result = service.get("T1").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_vehicle_is_not_cached() {
        let store = Arc::new(CountingStore::default());
        let cache = Arc::new(MemoryCache::new());
        let service = StatusQueryService::new(cache.clone(), store.clone());

        assert!(service.get("ghost").await.unwrap().is_none());
        assert!(cache.get(&cache_key("ghost")).await.unwrap().is_none());

        store.put_latest(state("ghost", 1.0)).await.unwrap();
        assert!(service.get("ghost").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cache_outage_falls_back_to_store() {
        let store = Arc::new(MemoryPointStore::new());
        store.put_latest(state("T1", 5.0)).await.unwrap();
        let service = StatusQueryService::new(Arc::new(BrokenCache), store);

        assert_eq!(service.get("T1").await.unwrap().unwrap().speed, Some(5.0));
    }

    #[tokio::test]
    async fn unreadable_cache_entry_is_ignored() {
        let cache = Arc::new(MemoryCache::new());
        cache
            .set_ex(&cache_key("T1"), "not json".to_string(), CACHE_TTL)
            .await
            .unwrap();
        let store = Arc::new(MemoryPointStore::new());
        store.put_latest(state("T1", 7.0)).await.unwrap();
        let service = StatusQueryService::new(cache, store);

        assert_eq!(service.get("T1").await.unwrap().unwrap().speed, Some(7.0));
    }

    #[tokio::test]
    async fn batch_omits_missing_ids() {
        let store = Arc::new(MemoryPointStore::new());
        store.put_latest(state("A", 1.0)).await.unwrap();
        store.put_latest(state("C", 3.0)).await.unwrap();
        let service = StatusQueryService::new(Arc::new(MemoryCache::new()), store);

        let ids = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let found: Vec<String> = service
            .batch_get(&ids)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.vehicle_id)
            .collect();
        assert_eq!(found, vec!["A", "C"]);
    }
}
