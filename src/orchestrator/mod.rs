//! Emergency orchestrator: consumes escalations and starts one emergency
//! workflow execution per message.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::escalation::{
    EscalationMessage, EscalationReceiver, CRITICAL_ANOMALY, CRITICAL_SEVERITY,
};
use crate::model::now_ms;
use crate::retry::{with_retry, IsRetryable, RetryConfig};

/// Escalation as read off the queue. Producers other than this crate may
/// omit fields, so everything except the vehicle id has a default.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InboundEscalation {
    #[serde(rename = "vehicleId")]
    pub vehicle_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub severity: Option<String>,
    pub location: Option<JsonValue>,
    pub timestamp: Option<i64>,
    pub metadata: Option<JsonMap<String, JsonValue>>,
}

impl From<EscalationMessage> for InboundEscalation {
    fn from(message: EscalationMessage) -> Self {
        Self {
            vehicle_id: Some(message.vehicle_id),
            kind: Some(message.kind),
            severity: Some(message.severity),
            location: message.location,
            timestamp: Some(message.timestamp),
            metadata: Some(message.metadata),
        }
    }
}

/// Input of one emergency workflow execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInvocation {
    pub vehicle_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: String,
    pub location: Option<JsonValue>,
    pub event_timestamp: i64,
    pub metadata: JsonMap<String, JsonValue>,
}

impl WorkflowInvocation {
    pub fn from_inbound(message: InboundEscalation, now_ms: i64) -> Result<Self, WorkflowError> {
        let vehicle_id = message
            .vehicle_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| WorkflowError::InvalidMessage("missing vehicleId".to_string()))?;

        Ok(Self {
            vehicle_id,
            kind: message.kind.unwrap_or_else(|| CRITICAL_ANOMALY.to_string()),
            severity: message
                .severity
                .unwrap_or_else(|| CRITICAL_SEVERITY.to_string()),
            location: message.location,
            event_timestamp: message.timestamp.unwrap_or(now_ms),
            metadata: message.metadata.unwrap_or_default(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid escalation message: {0}")]
    InvalidMessage(String),
    #[error("workflow start timed out")]
    Timeout,
    #[error("HTTP {status} from workflow endpoint")]
    Http { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected workflow response: {0}")]
    Response(String),
}

impl IsRetryable for WorkflowError {
    fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::Timeout | WorkflowError::Network(_) => true,
            WorkflowError::Http { status } => matches!(status, 429 | 502..=504),
            WorkflowError::InvalidMessage(_) | WorkflowError::Response(_) => false,
        }
    }
}

/// Starts an emergency workflow execution and returns its identifier.
#[async_trait::async_trait]
pub trait WorkflowStarter: Send + Sync {
    async fn start_execution(&self, input: &WorkflowInvocation) -> Result<String, WorkflowError>;
}

#[derive(Deserialize)]
struct StartExecutionResponse {
    #[serde(rename = "executionId", alias = "executionArn")]
    execution_id: String,
}

/// Starts executions by POSTing the invocation to a workflow endpoint.
pub struct HttpWorkflowStarter {
    client: Client,
    url: String,
    retry: RetryConfig,
}

impl HttpWorkflowStarter {
    pub fn new(url: String, timeout: Duration, retry: RetryConfig) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;
        Ok(Self { client, url, retry })
    }

    async fn start_once(&self, input: &WorkflowInvocation) -> Result<String, WorkflowError> {
        let response = self
            .client
            .post(&self.url)
            .json(input)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WorkflowError::Timeout
                } else {
                    WorkflowError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(WorkflowError::Http { status });
        }

        let started: StartExecutionResponse = response
            .json()
            .await
            .map_err(|e| WorkflowError::Response(e.to_string()))?;
        Ok(started.execution_id)
    }
}

#[async_trait::async_trait]
impl WorkflowStarter for HttpWorkflowStarter {
    async fn start_execution(&self, input: &WorkflowInvocation) -> Result<String, WorkflowError> {
        with_retry(&self.retry, || self.start_once(input)).await
    }
}

/// Local starter used when no workflow endpoint is configured: logs the
/// invocation and hands back a generated execution id.
#[derive(Default)]
pub struct LogWorkflowStarter;

#[async_trait::async_trait]
impl WorkflowStarter for LogWorkflowStarter {
    async fn start_execution(&self, input: &WorkflowInvocation) -> Result<String, WorkflowError> {
        let execution_id = format!("local-{}", uuid::Uuid::new_v4());
        info!(
            vehicle_id = %input.vehicle_id,
            severity = %input.severity,
            execution_id = %execution_id,
            "emergency workflow started (local)"
        );
        Ok(execution_id)
    }
}

#[derive(Clone)]
pub struct EmergencyOrchestrator {
    starter: Arc<dyn WorkflowStarter>,
}

impl EmergencyOrchestrator {
    pub fn new(starter: Arc<dyn WorkflowStarter>) -> Self {
        Self { starter }
    }

    /// Start exactly one workflow execution for one escalation.
    pub async fn handle(&self, message: InboundEscalation) -> Result<String, WorkflowError> {
        let invocation = WorkflowInvocation::from_inbound(message, now_ms())?;
        info!(
            vehicle_id = %invocation.vehicle_id,
            kind = %invocation.kind,
            "processing emergency"
        );
        let execution_id = self.starter.start_execution(&invocation).await?;
        info!(execution_id = %execution_id, "started emergency workflow");
        Ok(execution_id)
    }

    /// Handle a batch of raw JSON message bodies, stopping at the first
    /// failure so the whole batch is redelivered.
    pub async fn handle_batch(&self, bodies: &[String]) -> Result<Vec<String>, WorkflowError> {
        let mut executions = Vec::with_capacity(bodies.len());
        for body in bodies {
            let message: InboundEscalation = serde_json::from_str(body)
                .map_err(|e| WorkflowError::InvalidMessage(e.to_string()))?;
            executions.push(self.handle(message).await?);
        }
        Ok(executions)
    }

    /// Drain the in-process queue until every sender is gone. Returns the
    /// number of executions started.
    pub async fn run(self, mut rx: EscalationReceiver) -> usize {
        let mut started = 0;
        while let Some(message) = rx.recv().await {
            let vehicle_id = message.vehicle_id.clone();
            match self.handle(message.into()).await {
                Ok(_) => started += 1,
                Err(e) if e.is_retryable() => {
                    error!(
                        vehicle_id = %vehicle_id,
                        error = %e,
                        "emergency workflow start failed after retries"
                    );
                }
                Err(e) => {
                    warn!(vehicle_id = %vehicle_id, error = %e, "emergency message rejected");
                }
            }
        }
        info!(started, "escalation queue closed");
        started
    }
}
