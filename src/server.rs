//! HTTP and WebSocket surface.

use axum::{
    body::Bytes as AxumBytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::app::Fleet;
use crate::broadcast::{ClientAction, LocalGateway, WsMessage};
use crate::decode::{decompress_gzip, ContentEncoding, RawTelemetry};
use crate::ingest::IngestError;
use crate::model::now_ms;
use crate::orchestrator::WorkflowError;
use crate::registry::RegistryError;

/// Per-record encoding of an ingestion body's lines.
pub const PAYLOAD_ENCODING_HEADER: &str = "x-payload-encoding";

/// Initialize the tracing subscriber.
/// Uses RUST_LOG env var for filtering (defaults to info).
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_ansi(true)).init();
    }
}

pub fn build_router(fleet: Fleet) -> Router {
    Router::new()
        .route("/v1/telemetry", post(handle_ingest))
        .route("/v1/escalations", post(handle_escalations))
        .route("/api/vehicles/batch", post(handle_batch_status))
        .route("/api/vehicles/:vehicle_id", get(handle_status))
        .route("/ws", get(handle_ws_upgrade))
        .route("/ws/events", post(handle_gateway_event))
        .route("/health", get(|| async { "ok" }))
        .with_state(fleet)
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Split an ingestion body into raw records: a JSON array, or one record per
/// line. In an array, string items carry an encoded record and objects are
/// taken as plain JSON.
fn split_batch(
    body: &[u8],
    encoding: ContentEncoding,
    arrived_at_ms: i64,
) -> Result<Vec<RawTelemetry>, String> {
    let first = body.iter().find(|b| !b.is_ascii_whitespace());
    if first == Some(&b'[') {
        let items: Vec<JsonValue> =
            serde_json::from_slice(body).map_err(|e| format!("invalid JSON array: {}", e))?;
        return Ok(items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let raw = match item {
                    JsonValue::String(encoded) => {
                        RawTelemetry::json(encoded, arrived_at_ms).with_encoding(encoding)
                    }
                    other => RawTelemetry::json(other.to_string(), arrived_at_ms),
                };
                raw.with_sequence(i.to_string())
            })
            .collect());
    }

    Ok(body
        .split(|b| *b == b'\n')
        .map(|line| line.trim_ascii())
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| {
            RawTelemetry::json(line.to_vec(), arrived_at_ms)
                .with_encoding(encoding)
                .with_sequence(i.to_string())
        })
        .collect())
}

async fn handle_ingest(
    State(fleet): State<Fleet>,
    headers: HeaderMap,
    body: AxumBytes,
) -> Response {
    let gzipped = header_str(&headers, "content-encoding")
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);
    let body = if gzipped {
        match decompress_gzip(body) {
            Ok(body) => body,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, e.to_string()),
        }
    } else {
        body
    };

    let encoding = ContentEncoding::from_header(header_str(&headers, PAYLOAD_ENCODING_HEADER));
    let batch = match split_batch(&body, encoding, now_ms()) {
        Ok(batch) => batch,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, e),
    };

    match fleet.ingestor.process_batch(batch).await {
        Ok(summary) => Json(summary).into_response(),
        Err(IngestError::Escalation { summary, failures }) => {
            let failed: Vec<JsonValue> = failures
                .iter()
                .map(|f| json!({ "vehicleId": f.vehicle_id, "error": f.error.to_string() }))
                .collect();
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "escalation dispatch failed",
                    "summary": summary,
                    "failed": failed,
                })),
            )
                .into_response()
        }
    }
}

async fn handle_status(State(fleet): State<Fleet>, Path(vehicle_id): Path<String>) -> Response {
    match fleet.status.get(&vehicle_id).await {
        Ok(Some(state)) => Json(state).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Vehicle not found"),
        Err(e) => {
            error!(vehicle_id = %vehicle_id, error = %e, "status lookup failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

/// Escalation bodies delivered by an external queue.
#[derive(Deserialize)]
struct EscalationBatch {
    messages: Vec<String>,
}

/// Start one workflow per message. Any failure fails the whole batch so the
/// queue redelivers it.
async fn handle_escalations(
    State(fleet): State<Fleet>,
    Json(batch): Json<EscalationBatch>,
) -> Response {
    match fleet.orchestrator.handle_batch(&batch.messages).await {
        Ok(executions) => Json(json!({ "executions": executions })).into_response(),
        Err(e @ WorkflowError::InvalidMessage(_)) => {
            json_error(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            error!(error = %e, "emergency workflow start failed");
            json_error(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

#[derive(Deserialize)]
struct BatchStatusRequest {
    #[serde(rename = "vehicleIds")]
    vehicle_ids: Vec<String>,
}

async fn handle_batch_status(
    State(fleet): State<Fleet>,
    Json(request): Json<BatchStatusRequest>,
) -> Response {
    match fleet.status.batch_get(&request.vehicle_ids).await {
        Ok(vehicles) => Json(json!({ "vehicles": vehicles })).into_response(),
        Err(e) => {
            error!(error = %e, "batch status lookup failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

#[derive(Deserialize)]
struct WsParams {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

async fn handle_ws_upgrade(
    State(fleet): State<Fleet>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(sockets) = fleet.sockets.clone() else {
        return json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "sockets are terminated by the external gateway",
        );
    };
    ws.on_upgrade(move |socket| run_socket(socket, fleet, sockets, params.user_id))
}

async fn send_frame<S>(sink: &mut S, frame: &WsMessage) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    match frame.to_json() {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialize frame");
            true
        }
    }
}

async fn run_socket(
    socket: WebSocket,
    fleet: Fleet,
    sockets: Arc<LocalGateway>,
    user_id: Option<String>,
) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let mut outbound = sockets.register(&connection_id).await;
    let (mut sink, mut stream) = socket.split();

    let hello = match fleet.sessions.connect(&connection_id, user_id).await {
        Ok(hello) => hello,
        Err(e) => {
            error!(connection_id = %connection_id, error = %e, "failed to register connection");
            sockets.unregister(&connection_id).await;
            return;
        }
    };

    if send_frame(&mut sink, &hello).await {
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let reply = fleet.sessions.handle_text(&connection_id, &text).await;
                        if !send_frame(&mut sink, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "socket error");
                        break;
                    }
                },
                pushed = outbound.recv() => match pushed {
                    Some(payload) => {
                        if sink.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    sockets.unregister(&connection_id).await;
    if let Err(e) = fleet.sessions.disconnect(&connection_id).await {
        warn!(connection_id = %connection_id, error = %e, "failed to remove connection");
    }
}

/// Lifecycle event forwarded by an external WebSocket gateway.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayEvent {
    route_key: String,
    connection_id: String,
    #[serde(default)]
    query_string_parameters: Option<HashMap<String, String>>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Deserialize)]
struct SubscribeBody {
    #[serde(rename = "vehicleIds", default)]
    vehicle_ids: Vec<String>,
}

async fn handle_gateway_event(
    State(fleet): State<Fleet>,
    Json(event): Json<GatewayEvent>,
) -> Response {
    debug!(route = %event.route_key, connection_id = %event.connection_id, "gateway event");
    let sessions = &fleet.sessions;

    let result = match event.route_key.as_str() {
        "$connect" => {
            let user_id = event
                .query_string_parameters
                .and_then(|mut params| params.remove("userId"));
            sessions
                .connect(&event.connection_id, user_id)
                .await
                .map(|_| "Connected".into_response())
        }
        "$disconnect" => sessions
            .disconnect(&event.connection_id)
            .await
            .map(|_| "Disconnected".into_response()),
        "subscribe" => {
            let body: SubscribeBody =
                match serde_json::from_str(event.body.as_deref().unwrap_or("{}")) {
                    Ok(body) => body,
                    Err(e) => return json_error(StatusCode::BAD_REQUEST, e.to_string()),
                };
            let action = ClientAction::Subscribe {
                vehicle_ids: body.vehicle_ids,
            };
            sessions
                .apply(&event.connection_id, action)
                .await
                .map(|reply| match reply {
                    WsMessage::Subscribed { vehicles } => {
                        Json(json!({ "message": "Subscribed", "vehicles": vehicles }))
                            .into_response()
                    }
                    other => Json(other).into_response(),
                })
        }
        "ping" => Ok("pong".into_response()),
        _ => return (StatusCode::BAD_REQUEST, "Unknown route").into_response(),
    };

    match result {
        Ok(response) => response,
        Err(RegistryError::NotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, format!("connection {} not found", id))
        }
        Err(e) => {
            error!(error = %e, "gateway event failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}
