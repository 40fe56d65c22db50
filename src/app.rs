//! Component wiring.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::anomaly::AnomalyDetector;
use crate::broadcast::{
    BroadcastFanout, ConnectionGateway, HttpGateway, LocalGateway, SessionHandler,
};
use crate::cache::{Cache, MemoryCache};
use crate::config::AppConfig;
use crate::escalation::{
    EscalationDispatcher, EscalationQueue, EscalationReceiver, HttpEscalationQueue,
    MemoryEscalationQueue,
};
use crate::ingest::{IngestConfig, TelemetryIngestor};
use crate::model::now_ms;
use crate::orchestrator::{
    EmergencyOrchestrator, HttpWorkflowStarter, LogWorkflowStarter, WorkflowStarter,
};
use crate::registry::{ConnectionRegistry, MemoryConnectionRegistry};
use crate::retry::RetryConfig;
use crate::status::StatusQueryService;
use crate::store::{MemoryPointStore, MemoryTimeSeriesStore, PointStore, TimeSeriesStore};

/// The external ports a [`Fleet`] is assembled from.
pub struct Adapters {
    pub points: Arc<dyn PointStore>,
    pub series: Arc<dyn TimeSeriesStore>,
    pub cache: Arc<dyn Cache>,
    pub registry: Arc<dyn ConnectionRegistry>,
    pub gateway: Arc<dyn ConnectionGateway>,
    pub queue: Arc<dyn EscalationQueue>,
}

/// Escalation dispatch settings.
#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub timeout: Duration,
    pub dedup_window_ms: i64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            dedup_window_ms: 10_000,
        }
    }
}

/// Everything the HTTP surface needs.
#[derive(Clone)]
pub struct Fleet {
    pub ingestor: Arc<TelemetryIngestor>,
    pub status: StatusQueryService,
    pub sessions: SessionHandler,
    pub orchestrator: EmergencyOrchestrator,
    /// Set when sockets are terminated by this process.
    pub sockets: Option<Arc<LocalGateway>>,
}

impl Fleet {
    pub fn assemble(
        adapters: Adapters,
        sockets: Option<Arc<LocalGateway>>,
        orchestrator: EmergencyOrchestrator,
        ingest: IngestConfig,
        dispatch: DispatchSettings,
    ) -> Self {
        let dispatcher =
            EscalationDispatcher::new(adapters.queue, dispatch.timeout, dispatch.dedup_window_ms);
        let fanout = BroadcastFanout::new(adapters.registry.clone(), adapters.gateway);
        let ingestor = TelemetryIngestor::new(
            adapters.points.clone(),
            adapters.series,
            AnomalyDetector::new(dispatcher),
            fanout,
            ingest,
        );
        Self {
            ingestor: Arc::new(ingestor),
            status: StatusQueryService::new(adapters.cache, adapters.points),
            sessions: SessionHandler::new(adapters.registry),
            orchestrator,
            sockets,
        }
    }

    /// All in-memory adapters with the in-process escalation queue.
    pub fn in_memory(
        ingest: IngestConfig,
        dispatch: DispatchSettings,
    ) -> (Self, EscalationReceiver) {
        let (queue, rx) = MemoryEscalationQueue::new(Duration::from_secs(300));
        let sockets = Arc::new(LocalGateway::new());
        let adapters = Adapters {
            points: Arc::new(MemoryPointStore::new()),
            series: Arc::new(MemoryTimeSeriesStore::new()),
            cache: Arc::new(MemoryCache::new()),
            registry: Arc::new(MemoryConnectionRegistry::new()),
            gateway: sockets.clone(),
            queue: Arc::new(queue),
        };
        let orchestrator = EmergencyOrchestrator::new(Arc::new(LogWorkflowStarter));
        let fleet = Self::assemble(adapters, Some(sockets), orchestrator, ingest, dispatch);
        (fleet, rx)
    }
}

/// A configured fleet plus its background work.
pub struct Runtime {
    pub fleet: Fleet,
    /// Present when escalations go to the in-process queue.
    pub escalations: Option<EscalationReceiver>,
    pub janitor: Janitor,
}

/// Drops expired entries from the in-memory adapters. Readers already ignore
/// them; this only bounds memory.
pub struct Janitor {
    points: Arc<MemoryPointStore>,
    cache: Arc<MemoryCache>,
    registry: Arc<MemoryConnectionRegistry>,
}

impl Janitor {
    pub async fn sweep(&self, now_ms: i64) {
        let points = self.points.purge_expired(now_ms).await;
        let cached = self.cache.purge_expired().await;
        let connections = match self.registry.purge_expired(now_ms).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "registry purge failed");
                0
            }
        };
        if points + cached + connections > 0 {
            debug!(points, cached, connections, "expired entries purged");
        }
    }

    /// Sweep on a fixed interval until the task is dropped.
    pub async fn run(self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep(now_ms()).await;
        }
    }
}

/// Build every component from configuration.
pub async fn from_config(config: &AppConfig) -> Result<Runtime> {
    let registry = match config.registry.snapshot() {
        Some(path) => MemoryConnectionRegistry::with_snapshot(path)
            .await
            .with_context(|| format!("Failed to open registry snapshot {}", path.display()))?,
        None => MemoryConnectionRegistry::new(),
    };
    let registry = Arc::new(registry);
    let points = Arc::new(MemoryPointStore::new());
    let cache = Arc::new(MemoryCache::new());

    let mut sockets = None;
    let gateway: Arc<dyn ConnectionGateway> = match &config.gateway.endpoint {
        Some(endpoint) => {
            let timeout = Duration::from_millis(config.gateway.timeout_ms);
            let gateway = HttpGateway::new(endpoint.clone(), timeout).map_err(|e| anyhow!(e))?;
            info!(endpoint = %endpoint, "broadcasting through external gateway");
            Arc::new(gateway)
        }
        None => {
            let local = Arc::new(LocalGateway::new());
            sockets = Some(local.clone());
            local
        }
    };

    let mut escalations = None;
    let queue: Arc<dyn EscalationQueue> = match &config.escalation.queue_url {
        Some(url) => {
            let queue = HttpEscalationQueue::new(
                url.clone(),
                config.escalation.timeout(),
                config.escalation.queue_dedup,
            )
            .map_err(|e| anyhow!(e))?;
            info!(url = %url, "escalations go to HTTP queue");
            Arc::new(queue)
        }
        None => {
            let (queue, rx) = MemoryEscalationQueue::new(config.escalation.dedup_interval());
            escalations = Some(rx);
            Arc::new(queue)
        }
    };

    let starter: Arc<dyn WorkflowStarter> = match &config.workflow.url {
        Some(url) => Arc::new(
            HttpWorkflowStarter::new(
                url.clone(),
                Duration::from_millis(config.workflow.timeout_ms),
                RetryConfig::exponential(config.workflow.max_attempts, 250, 5_000),
            )
            .map_err(|e| anyhow!(e))?,
        ),
        None => Arc::new(LogWorkflowStarter),
    };

    let adapters = Adapters {
        points: points.clone(),
        series: Arc::new(MemoryTimeSeriesStore::new()),
        cache: cache.clone(),
        registry: registry.clone(),
        gateway,
        queue,
    };
    let dispatch = DispatchSettings {
        timeout: config.escalation.timeout(),
        dedup_window_ms: config.escalation.dedup_window_ms,
    };

    let orchestrator = EmergencyOrchestrator::new(starter);
    let ingest = config.ingest.to_ingest_config();

    Ok(Runtime {
        fleet: Fleet::assemble(adapters, sockets, orchestrator, ingest, dispatch),
        escalations,
        janitor: Janitor {
            points,
            cache,
            registry,
        },
    })
}
