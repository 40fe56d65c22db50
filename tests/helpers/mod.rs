#![allow(dead_code)] // Test helpers appear unused when compiled independently

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fleetwatch::broadcast::{ConnectionGateway, DeliveryError};
use fleetwatch::orchestrator::{WorkflowError, WorkflowInvocation, WorkflowStarter};
use fleetwatch::Fleet;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

const WAIT_ATTEMPTS: usize = 50;
const WAIT_DELAY: Duration = Duration::from_millis(100);

/// Find an available TCP port
pub async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
pub async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true, // treat other errors as non-fatal for skipping
    }
}

/// A server running in the background until stopped.
pub struct RunningServer {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    pub base_url: String,
}

impl RunningServer {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

async fn serve(app: Router) -> RunningServer {
    let port = free_port().await;
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("failed to bind listener");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = server.await {
            eprintln!("test server error: {}", err);
        }
    });

    RunningServer {
        shutdown_tx,
        handle,
        base_url: format!("http://127.0.0.1:{}", port),
    }
}

/// Serve the fleet's router on a free loopback port and wait until healthy.
pub async fn spawn_app(fleet: Fleet) -> RunningServer {
    let server = serve(fleetwatch::build_router(fleet)).await;
    wait_for_health(&Client::new(), &server.base_url).await;
    server
}

/// Stand-in for the external services: a workflow engine, an escalation
/// queue and a WebSocket gateway management API.
#[derive(Clone, Default)]
pub struct RemoteState {
    pub invocations: Arc<Mutex<Vec<Value>>>,
    pub enqueued: Arc<Mutex<Vec<Value>>>,
    pub pushed: Arc<Mutex<Vec<(String, String)>>>,
    /// Connection ids the gateway answers 410 for.
    pub gone: Arc<Mutex<BTreeSet<String>>>,
    /// Number of workflow calls to answer with 503 before succeeding.
    pub workflow_failures: Arc<AtomicUsize>,
}

pub async fn spawn_mock_remote(state: RemoteState) -> RunningServer {
    let app = Router::new()
        .route("/workflow", post(start_workflow))
        .route("/queue", post(enqueue))
        .route("/gateway/@connections/:connection_id", post(push))
        .route("/health", get(health))
        .with_state(state);
    let server = serve(app).await;
    wait_for_health(&Client::new(), &server.base_url).await;
    server
}

async fn start_workflow(State(state): State<RemoteState>, Json(body): Json<Value>) -> Response {
    let remaining = state.workflow_failures.load(Ordering::SeqCst);
    if remaining > 0 {
        state.workflow_failures.store(remaining - 1, Ordering::SeqCst);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let mut invocations = state.invocations.lock().await;
    invocations.push(body);
    Json(json!({ "executionId": format!("exec-{}", invocations.len()) })).into_response()
}

async fn enqueue(State(state): State<RemoteState>, Json(body): Json<Value>) -> StatusCode {
    state.enqueued.lock().await.push(body);
    StatusCode::OK
}

async fn push(
    State(state): State<RemoteState>,
    Path(connection_id): Path<String>,
    body: String,
) -> StatusCode {
    if state.gone.lock().await.contains(&connection_id) {
        return StatusCode::GONE;
    }
    state.pushed.lock().await.push((connection_id, body));
    StatusCode::OK
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Wait for a server to respond to /health
pub async fn wait_for_health(client: &Client, base_url: &str) {
    poll_until(|| async {
        client
            .get(format!("{}/health", base_url))
            .send()
            .await
            .ok()
            .map(|_| ())
    })
    .await
    .unwrap_or_else(|| panic!("timed out waiting for {} to be healthy", base_url));
}

pub async fn poll_until<T, F, Fut>(mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..WAIT_ATTEMPTS {
        if let Some(result) = f().await {
            return Some(result);
        }
        tokio::time::sleep(WAIT_DELAY).await;
    }
    None
}

/// Workflow starter that records every invocation.
#[derive(Default)]
pub struct RecordingStarter {
    pub invocations: Mutex<Vec<WorkflowInvocation>>,
}

#[async_trait::async_trait]
impl WorkflowStarter for RecordingStarter {
    async fn start_execution(&self, input: &WorkflowInvocation) -> Result<String, WorkflowError> {
        let mut invocations = self.invocations.lock().await;
        invocations.push(input.clone());
        Ok(format!("exec-{}", invocations.len()))
    }
}

/// Gateway that records pushes and reports the listed ids as gone.
#[derive(Default)]
pub struct RecordingGateway {
    pub pushed: Mutex<Vec<(String, Value)>>,
    pub gone: Mutex<BTreeSet<String>>,
}

impl RecordingGateway {
    pub async fn mark_gone(&self, connection_id: &str) {
        self.gone.lock().await.insert(connection_id.to_string());
    }

    pub async fn frames_for(&self, connection_id: &str) -> Vec<Value> {
        self.pushed
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == connection_id)
            .map(|(_, frame)| frame.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ConnectionGateway for RecordingGateway {
    async fn push(&self, connection_id: &str, payload: &str) -> Result<(), DeliveryError> {
        if self.gone.lock().await.contains(connection_id) {
            return Err(DeliveryError::Gone);
        }
        let frame: Value =
            serde_json::from_str(payload).map_err(|e| DeliveryError::Failed(e.to_string()))?;
        self.pushed
            .lock()
            .await
            .push((connection_id.to_string(), frame));
        Ok(())
    }
}
