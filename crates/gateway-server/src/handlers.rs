//! HTTP handlers for the session API.
//!
//! JSON bodies are read as raw bytes and decoded here so that malformed or
//! missing bodies produce the same `{"error": ...}` shape as every other
//! failure.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use gateway_core::ids::{SessionId, ToolCallId};
use gateway_core::session::{HistoryMessage, PermissionMode, SessionSummary};
use gateway_engine::{SessionOptions, TurnRequest};

use crate::error::ApiError;
use crate::health::{self, HealthResponse};
use crate::server::AppState;
use crate::sse;

const NEW_SESSION_TITLE: &str = "New Session";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub permission_mode: Option<PermissionMode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub content: Option<String>,
    pub permission_mode: Option<PermissionMode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalBody {
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// An empty body decodes as `T::default()`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SessionSummary>, ApiError> {
    let body: CreateSessionBody = parse_body(&body)?;
    let permission_mode = body.permission_mode.unwrap_or_default();
    let id = SessionId::new();
    state.executor.registry().ensure_session(
        &id,
        SessionOptions {
            permission_mode,
            has_started: false,
        },
    );

    let now = Utc::now();
    Ok(Json(SessionSummary {
        id,
        title: NEW_SESSION_TITLE.into(),
        created_at: now,
        updated_at: now,
        last_message_preview: None,
        permission_mode,
    }))
}

/// GET /sessions?limit=
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<SessionSummary>> {
    let limit = state.config.list_limit(query.limit.as_deref());
    let mut sessions = state.executor.store().list_sessions().await;
    sessions.truncate(limit);
    Json(sessions)
}

/// GET /sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    state
        .executor
        .store()
        .get_session(&SessionId::from_raw(id))
        .await
        .map(Json)
        .ok_or(ApiError::NotFound("Session not found"))
}

/// GET /sessions/{id}/messages
pub async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<MessagesResponse> {
    let messages = state
        .executor
        .store()
        .read_transcript(&SessionId::from_raw(id))
        .await;
    Json(MessagesResponse { messages })
}

/// POST /sessions/{id}/messages, answered with an SSE stream.
pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body: SendMessageBody = parse_body(&body)?;
    let content = body
        .content
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::BadRequest("content is required".into()))?;

    let request = TurnRequest {
        session_id: SessionId::from_raw(id),
        content,
        permission_mode: body.permission_mode,
    };
    let events = state.executor.send_message(request).await?;
    Ok(sse::sse_response(events).into_response())
}

/// POST /sessions/{id}/approve
pub async fn approve(
    state: State<AppState>,
    id: Path<String>,
    body: Bytes,
) -> Result<Json<OkResponse>, ApiError> {
    resolve_approval(state, id, body, true)
}

/// POST /sessions/{id}/deny
pub async fn deny(
    state: State<AppState>,
    id: Path<String>,
    body: Bytes,
) -> Result<Json<OkResponse>, ApiError> {
    resolve_approval(state, id, body, false)
}

fn resolve_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
    approved: bool,
) -> Result<Json<OkResponse>, ApiError> {
    let body: ApprovalBody = parse_body(&body)?;
    let tool_call_id = ToolCallId::from_raw(body.tool_call_id.unwrap_or_default());
    let resolved = state
        .executor
        .registry()
        .approve_tool(&SessionId::from_raw(id), &tool_call_id, approved);
    if !resolved {
        return Err(ApiError::NotFound("No pending approval"));
    }
    Ok(Json(OkResponse { ok: true }))
}

/// POST /sessions/{id}/abort
pub async fn abort(State(state): State<AppState>, Path(id): Path<String>) -> Json<OkResponse> {
    let id = SessionId::from_raw(id);
    let ok = state.executor.abort(&id);
    if !ok {
        info!(session_id = %id, "abort requested with no turn running");
    }
    Json(OkResponse { ok })
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.executor.registry().len(),
        state.executor.active_turns(),
    ))
}
