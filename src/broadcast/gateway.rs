//! Push side of the real-time transport.

use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The connection no longer exists on the transport.
    #[error("connection gone")]
    Gone,
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Delivers a serialized frame to one connection id.
#[async_trait::async_trait]
pub trait ConnectionGateway: Send + Sync {
    async fn push(&self, connection_id: &str, payload: &str) -> Result<(), DeliveryError>;
}

/// Gateway for sockets terminated by this process. Each socket task registers
/// a channel and forwards whatever arrives on it.
#[derive(Default)]
pub struct LocalGateway {
    sockets: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl LocalGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets
            .write()
            .await
            .insert(connection_id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, connection_id: &str) {
        self.sockets.write().await.remove(connection_id);
    }

    pub async fn len(&self) -> usize {
        self.sockets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sockets.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl ConnectionGateway for LocalGateway {
    async fn push(&self, connection_id: &str, payload: &str) -> Result<(), DeliveryError> {
        let sockets = self.sockets.read().await;
        let tx = sockets.get(connection_id).ok_or(DeliveryError::Gone)?;
        tx.send(payload.to_string()).map_err(|_| DeliveryError::Gone)
    }
}

/// Management API of an external WebSocket gateway:
/// `POST {endpoint}/@connections/{id}` with the frame as body.
pub struct HttpGateway {
    client: Client,
    endpoint: String,
}

impl HttpGateway {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    fn connection_url(&self, connection_id: &str) -> String {
        format!("{}/@connections/{}", self.endpoint, connection_id)
    }
}

#[async_trait::async_trait]
impl ConnectionGateway for HttpGateway {
    async fn push(&self, connection_id: &str, payload: &str) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.connection_url(connection_id))
            .header("Content-Type", "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| DeliveryError::Failed(e.to_string()))?;

        match response.status() {
            StatusCode::GONE => {
                debug!(connection_id, "gateway reports connection gone");
                Err(DeliveryError::Gone)
            }
            status if status.is_success() => Ok(()),
            status => Err(DeliveryError::Failed(format!("HTTP {}", status.as_u16()))),
        }
    }
}
