use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::{dedup_key, DispatchError, EnqueueRequest, EscalationMessage, EscalationQueue};

/// What the trigger accepted for one escalation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub group_id: String,
    pub dedup_id: Option<String>,
}

/// Deduplicates and forwards escalations to the trigger.
///
/// Enqueue failures, including timeouts, are returned to the caller and never
/// retried here.
#[derive(Clone)]
pub struct EscalationDispatcher {
    queue: Arc<dyn EscalationQueue>,
    timeout: Duration,
    dedup_window_ms: i64,
}

impl EscalationDispatcher {
    pub fn new(queue: Arc<dyn EscalationQueue>, timeout: Duration, dedup_window_ms: i64) -> Self {
        Self {
            queue,
            timeout,
            dedup_window_ms,
        }
    }

    #[tracing::instrument(
        name = "escalate",
        skip(self, message),
        fields(vehicle_id = %message.vehicle_id, anomalies = message.anomalies.len())
    )]
    pub async fn dispatch(
        &self,
        mut message: EscalationMessage,
    ) -> Result<DispatchReceipt, DispatchError> {
        let key = dedup_key(&message.vehicle_id, message.timestamp, self.dedup_window_ms);
        message.dedup_key = Some(key.clone());

        let receipt = DispatchReceipt {
            group_id: message.vehicle_id.clone(),
            dedup_id: self.queue.supports_dedup().then_some(key),
        };
        let request = EnqueueRequest {
            group_id: receipt.group_id.clone(),
            dedup_id: receipt.dedup_id.clone(),
            body: message,
        };

        match tokio::time::timeout(self.timeout, self.queue.enqueue(request)).await {
            Ok(Ok(())) => {
                info!(dedup_id = ?receipt.dedup_id, "critical anomaly escalated");
                Ok(receipt)
            }
            Ok(Err(e)) => {
                error!(error = %e, "escalation enqueue failed");
                Err(e)
            }
            Err(_) => {
                error!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "escalation enqueue timed out"
                );
                Err(DispatchError::Timeout(self.timeout))
            }
        }
    }
}
