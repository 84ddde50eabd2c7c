use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::database::{Chat, ChatMemory, Turn};
use crate::engine::{ChatEngine, TurnEvent, TurnStream};
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::runtime::EngineRuntime;

const DONE_FRAME: &str = "data: [DONE]\n\n";

#[derive(Clone)]
pub struct ServerState {
    pub engine: Arc<ChatEngine>,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ListChatsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CreateChatRequest {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenameChatRequest {
    title: String,
}

#[derive(Debug, Deserialize)]
struct StreamMessageRequest {
    chat_id: Option<String>,
    content: String,
}

#[derive(Debug, Deserialize)]
struct EditMessageRequest {
    chat_id: String,
    target_turn_id: String,
    new_content: String,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

type ApiError = (StatusCode, String);

pub async fn serve_backend(
    runtime: EngineRuntime,
    event_rx: flume::Receiver<EngineEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("CHATLOOM_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid CHATLOOM_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        engine: runtime.engine.clone(),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Chatloom backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/chats", get(list_chats).post(create_chat))
        .route(
            "/chats/:id",
            get(get_chat).patch(rename_chat).delete(delete_chat),
        )
        .route("/chats/:id/turns", get(list_turns))
        .route("/chats/:id/memory", get(get_memory))
        .route("/chats/:id/cancel", post(cancel_chat))
        .route("/messages/stream", post(stream_message))
        .route("/messages/edit", post(edit_message))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<EngineEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_engine_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_engine_event(event: EngineEvent) -> ApiEventEnvelope {
    match event {
        EngineEvent::Degraded {
            chat_id,
            component,
            reason,
        } => envelope(
            "degraded",
            serde_json::json!({
                "chat_id": chat_id,
                "component": component,
                "reason": reason
            }),
        ),
        EngineEvent::Compressed {
            chat_id,
            batch_size,
            remaining_unsummarized,
        } => envelope(
            "compressed",
            serde_json::json!({
                "chat_id": chat_id,
                "batch_size": batch_size,
                "remaining_unsummarized": remaining_unsummarized
            }),
        ),
        EngineEvent::TurnCommitted {
            chat_id,
            turn_id,
            sequence,
        } => envelope(
            "turn_committed",
            serde_json::json!({
                "chat_id": chat_id,
                "turn_id": turn_id,
                "sequence": sequence
            }),
        ),
        EngineEvent::GenerationCancelled { chat_id } => envelope(
            "generation_cancelled",
            serde_json::json!({ "chat_id": chat_id }),
        ),
        EngineEvent::GenerationFailed { chat_id, error } => envelope(
            "generation_failed",
            serde_json::json!({ "chat_id": chat_id, "error": error }),
        ),
        EngineEvent::HistoryTruncated {
            chat_id,
            after_sequence,
            removed,
        } => envelope(
            "history_truncated",
            serde_json::json!({
                "chat_id": chat_id,
                "after_sequence": after_sequence,
                "removed": removed
            }),
        ),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("CHATLOOM_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("CHATLOOM_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "CHATLOOM_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid CHATLOOM_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn list_chats(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListChatsQuery>,
) -> Result<Json<Vec<Chat>>, ApiError> {
    let limit = clamp_limit(query.limit, 100, 1, 1000);
    state
        .engine
        .list_chats(limit)
        .map(Json)
        .map_err(engine_error)
}

async fn create_chat(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<Chat>), ApiError> {
    let title = body
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty());
    state
        .engine
        .create_chat(title)
        .map(|chat| (StatusCode::CREATED, Json(chat)))
        .map_err(engine_error)
}

async fn get_chat(
    State(state): State<Arc<ServerState>>,
    Path(chat_id): Path<String>,
) -> Result<Json<Chat>, ApiError> {
    state.engine.get_chat(&chat_id).map(Json).map_err(engine_error)
}

async fn rename_chat(
    State(state): State<Arc<ServerState>>,
    Path(chat_id): Path<String>,
    Json(body): Json<RenameChatRequest>,
) -> Result<Json<Chat>, ApiError> {
    state
        .engine
        .rename_chat(&chat_id, &body.title)
        .map(Json)
        .map_err(engine_error)
}

async fn delete_chat(
    State(state): State<Arc<ServerState>>,
    Path(chat_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .delete_chat(&chat_id)
        .await
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_turns(
    State(state): State<Arc<ServerState>>,
    Path(chat_id): Path<String>,
) -> Result<Json<Vec<Turn>>, ApiError> {
    state.engine.history(&chat_id).map(Json).map_err(engine_error)
}

async fn get_memory(
    State(state): State<Arc<ServerState>>,
    Path(chat_id): Path<String>,
) -> Result<Json<ChatMemory>, ApiError> {
    state.engine.memory(&chat_id).map(Json).map_err(engine_error)
}

async fn cancel_chat(
    State(state): State<Arc<ServerState>>,
    Path(chat_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state.engine.cancel(&chat_id).await.map_err(engine_error)?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn stream_message(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<StreamMessageRequest>,
) -> Result<Response, ApiError> {
    let chat_id = body
        .chat_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());
    let stream = state
        .engine
        .submit_turn(chat_id, &body.content)
        .await
        .map_err(engine_error)?;
    sse_response(stream)
}

async fn edit_message(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<EditMessageRequest>,
) -> Result<Response, ApiError> {
    let stream = state
        .engine
        .edit_turn(&body.chat_id, &body.target_turn_id, &body.new_content)
        .await
        .map_err(engine_error)?;
    sse_response(stream)
}

/// Stream a turn as `text/event-stream`. A client disconnect drops the body,
/// which drops the [`TurnStream`] and cancels the turn.
fn sse_response(stream: TurnStream) -> Result<Response, ApiError> {
    let chat_id = stream.chat_id.clone();
    let frames = futures_util::stream::unfold(Some(stream), move |state| {
        let chat_id = chat_id.clone();
        async move {
            let mut stream = state?;
            match stream.recv().await {
                Some(event) => {
                    let mut frame = sse_frame(&turn_event_payload(&chat_id, &event));
                    if event.is_terminal() {
                        frame.push_str(DONE_FRAME);
                        return Some((Ok::<_, Infallible>(frame), None));
                    }
                    Some((Ok(frame), Some(stream)))
                }
                None => Some((Ok(DONE_FRAME.to_string()), None)),
            }
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(frames))
        .map_err(|error| internal_error(anyhow!(error)))
}

fn sse_frame(payload: &serde_json::Value) -> String {
    format!("data: {}\n\n", payload)
}

fn turn_event_payload(chat_id: &str, event: &TurnEvent) -> serde_json::Value {
    match event {
        TurnEvent::Fragment(content) => serde_json::json!({
            "content": content,
            "chat_id": chat_id
        }),
        TurnEvent::Degraded { component, reason } => serde_json::json!({
            "status": "degraded",
            "chat_id": chat_id,
            "component": component,
            "reason": reason
        }),
        TurnEvent::Completed(turn) => serde_json::json!({
            "status": "completed",
            "chat_id": chat_id,
            "turn_id": turn.id,
            "sequence": turn.sequence
        }),
        TurnEvent::Failed(error) => serde_json::json!({
            "status": "failed",
            "chat_id": chat_id,
            "error": error
        }),
        TurnEvent::Cancelled => serde_json::json!({
            "status": "cancelled",
            "chat_id": chat_id
        }),
    }
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Websocket subscriber lagged; skipped {} event(s)", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn engine_error(error: EngineError) -> ApiError {
    let status = match &error {
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::ImmutableHistory { .. } | EngineError::ConcurrentModification { .. } => {
            StatusCode::CONFLICT
        }
        EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EngineError::RetrievalUnavailable(_) | EngineError::SummarizationFailed(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::GenerationFailed(_) => StatusCode::BAD_GATEWAY,
        EngineError::Storage(_) => {
            tracing::error!("Storage failure while serving request: {:#}", error);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, format!("{}: {}", error.code(), error))
}

fn internal_error(error: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
