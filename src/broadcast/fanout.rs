use futures::future::join_all;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{ConnectionGateway, DeliveryError, WsMessage};
use crate::registry::ConnectionRegistry;

/// Outcome of one broadcast. Best-effort, never an error.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Connections pruned because the transport reported them gone.
    pub gone: Vec<String>,
    pub failed: usize,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.gone.len() + self.failed
    }
}

/// Pushes vehicle updates to every live connection subscribed to the vehicle.
#[derive(Clone)]
pub struct BroadcastFanout {
    registry: Arc<dyn ConnectionRegistry>,
    gateway: Arc<dyn ConnectionGateway>,
}

impl BroadcastFanout {
    pub fn new(registry: Arc<dyn ConnectionRegistry>, gateway: Arc<dyn ConnectionGateway>) -> Self {
        Self { registry, gateway }
    }

    /// Deliver to all subscribers concurrently and wait for every delivery to
    /// settle. Gone connections are removed from the registry; other failures
    /// are logged and dropped.
    #[tracing::instrument(name = "broadcast", skip(self, data))]
    pub async fn broadcast(
        &self,
        vehicle_id: &str,
        data: &JsonValue,
        now_ms: i64,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let subscribers = match self.registry.subscribers_of(vehicle_id, now_ms).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "subscriber lookup failed, skipping broadcast");
                return report;
            }
        };
        if subscribers.is_empty() {
            return report;
        }

        let payload = match WsMessage::vehicle_update(vehicle_id, data.clone()).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize vehicle update");
                return report;
            }
        };

        let deliveries = subscribers.into_iter().map(|connection_id| {
            let payload = payload.as_str();
            async move {
                let result = self.gateway.push(&connection_id, payload).await;
                (connection_id, result)
            }
        });

        for (connection_id, result) in join_all(deliveries).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::Gone) => {
                    debug!(connection_id = %connection_id, "pruning gone connection");
                    if let Err(e) = self.registry.disconnect(&connection_id).await {
                        warn!(
                            connection_id = %connection_id,
                            error = %e,
                            "failed to prune connection"
                        );
                    }
                    report.gone.push(connection_id);
                }
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "delivery failed");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Connection, MemoryConnectionRegistry};
    use serde_json::json;
    use std::collections::{BTreeSet, HashMap};
    use tokio::sync::Mutex;

    /// Records pushes; ids in `gone` or `broken` fail instead.
    #[derive(Default)]
    struct ScriptedGateway {
        pushed: Mutex<Vec<(String, String)>>,
        gone: BTreeSet<String>,
        broken: BTreeSet<String>,
    }

    #[async_trait::async_trait]
    impl ConnectionGateway for ScriptedGateway {
        async fn push(&self, connection_id: &str, payload: &str) -> Result<(), DeliveryError> {
            if self.gone.contains(connection_id) {
                return Err(DeliveryError::Gone);
            }
            if self.broken.contains(connection_id) {
                return Err(DeliveryError::Failed("HTTP 500".to_string()));
            }
            self.pushed
                .lock()
                .await
                .push((connection_id.to_string(), payload.to_string()));
            Ok(())
        }
    }

    async fn registry_with(subs: &[(&str, &[&str])]) -> Arc<MemoryConnectionRegistry> {
        let registry = Arc::new(MemoryConnectionRegistry::new());
        for (id, vehicles) in subs {
            registry.connect(Connection::new(*id, None, 0)).await.unwrap();
            let set = vehicles.iter().map(|v| v.to_string()).collect();
            registry.subscribe(id, set, 0).await.unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn delivers_only_to_subscribers() {
        let registry = registry_with(&[("c1", &["A", "B"]), ("c2", &["B"])]).await;
        let gateway = Arc::new(ScriptedGateway::default());
        let fanout = BroadcastFanout::new(registry, gateway.clone());

        let report = fanout.broadcast("A", &json!({"speed": 10}), 1).await;
        assert_eq!(report.delivered, 1);

        let pushed = gateway.pushed.lock().await;
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, "c1");
        let frame: JsonValue = serde_json::from_str(&pushed[0].1).unwrap();
        assert_eq!(frame["type"], "vehicle_update");
        assert_eq!(frame["vehicleId"], "A");
        assert_eq!(frame["data"]["speed"], 10);
    }

    #[tokio::test]
    async fn gone_connections_are_pruned_and_others_still_served() {
        let registry = registry_with(&[("c1", &["A"]), ("c2", &["A"]), ("c3", &["A"])]).await;
        let gateway = Arc::new(ScriptedGateway {
            gone: ["c2".to_string()].into(),
            broken: ["c3".to_string()].into(),
            ..Default::default()
        });
        let fanout = BroadcastFanout::new(registry.clone(), gateway.clone());

        let report = fanout.broadcast("A", &json!({}), 1).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.gone, vec!["c2".to_string()]);
        assert_eq!(report.failed, 1);
        assert_eq!(report.attempted(), 3);

        assert!(registry.get("c2").await.unwrap().is_none());
        assert!(registry.get("c3").await.unwrap().is_some());
        let mut remaining = registry.subscribers_of("A", 1).await.unwrap();
        remaining.sort();
        assert_eq!(remaining, vec!["c1", "c3"]);
    }

    #[tokio::test]
    async fn no_subscribers_is_a_quiet_no_op() {
        let registry = registry_with(&[("c1", &["B"])]).await;
        let gateway = Arc::new(ScriptedGateway::default());
        let fanout = BroadcastFanout::new(registry, gateway.clone());

        let report = fanout.broadcast("A", &json!({}), 1).await;
        assert_eq!(report, BroadcastReport::default());
        assert!(gateway.pushed.lock().await.is_empty());
    }

    #[tokio::test]
    async fn each_subscriber_gets_exactly_one_frame() {
        let registry = registry_with(&[("c1", &["A"]), ("c2", &["A"])]).await;
        let gateway = Arc::new(ScriptedGateway::default());
        let fanout = BroadcastFanout::new(registry, gateway.clone());

        fanout.broadcast("A", &json!({"n": 1}), 1).await;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for (id, _) in gateway.pushed.lock().await.iter() {
            *counts.entry(id.clone()).or_default() += 1;
        }
        assert_eq!(counts.get("c1"), Some(&1));
        assert_eq!(counts.get("c2"), Some(&1));
    }
}
