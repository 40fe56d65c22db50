//! Escalation trigger adapters.

use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error};

use super::{DispatchError, EnqueueRequest, EscalationMessage, EscalationQueue};

/// Consumer side of the in-process queue.
pub type EscalationReceiver = mpsc::UnboundedReceiver<EscalationMessage>;

/// In-process FIFO queue with a deduplication interval.
///
/// A single channel keeps every partition in send order. Messages whose
/// dedup id was already accepted within the interval are acknowledged and
/// dropped.
pub struct MemoryEscalationQueue {
    tx: mpsc::UnboundedSender<EscalationMessage>,
    seen: Mutex<HashMap<String, Instant>>,
    dedup_interval: Duration,
}

impl MemoryEscalationQueue {
    pub fn new(dedup_interval: Duration) -> (Self, EscalationReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            seen: Mutex::new(HashMap::new()),
            dedup_interval,
        };
        (queue, rx)
    }
}

#[async_trait::async_trait]
impl EscalationQueue for MemoryEscalationQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<(), DispatchError> {
        let mut seen = self.seen.lock().await;
        let now = Instant::now();
        seen.retain(|_, accepted_at| now.duration_since(*accepted_at) < self.dedup_interval);

        if let Some(dedup_id) = &request.dedup_id {
            if seen.contains_key(dedup_id) {
                debug!(
                    dedup_id = %dedup_id,
                    group_id = %request.group_id,
                    "duplicate escalation suppressed"
                );
                return Ok(());
            }
        }

        self.tx
            .send(request.body)
            .map_err(|_| DispatchError::Rejected("escalation queue closed".to_string()))?;

        if let Some(dedup_id) = request.dedup_id {
            seen.insert(dedup_id, now);
        }
        Ok(())
    }
}

/// Posts escalations as JSON to an HTTP queue endpoint.
pub struct HttpEscalationQueue {
    client: Client,
    url: String,
    supports_dedup: bool,
}

impl HttpEscalationQueue {
    pub fn new(url: String, timeout: Duration, supports_dedup: bool) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            url,
            supports_dedup,
        })
    }
}

#[async_trait::async_trait]
impl EscalationQueue for HttpEscalationQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<(), DispatchError> {
        let body =
            serde_json::to_vec(&request).map_err(|e| DispatchError::Serialize(e.to_string()))?;

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| DispatchError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let resp_body = response
                .text()
                .await
                .unwrap_or_else(|_| "(failed to read body)".to_string());
            error!(
                url = %self.url,
                status,
                response_body = %resp_body,
                "escalation queue returned error status"
            );
            return Err(DispatchError::Rejected(format!("HTTP {}", status)));
        }
        Ok(())
    }

    fn supports_dedup(&self) -> bool {
        self.supports_dedup
    }
}
