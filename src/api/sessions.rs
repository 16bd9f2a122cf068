//! Session routes: lifecycle, messaging, heartbeat, renewal, timeout.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::AppState;
use crate::error::{ApiError, ErrorCode};
use crate::runtime::AgentInput;
use crate::sessions::timeout::TimeoutConfigPatch;
use crate::transport::{self, Transport};
use crate::validate;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_session).get(list_sessions))
        .route("/health", get(sessions_health))
        .route("/:session_id", get(get_session).delete(delete_session))
        .route(
            "/:session_id/messages",
            post(send_session_message).get(get_session_messages),
        )
        .route("/:session_id/heartbeat", post(session_heartbeat))
        .route("/:session_id/renew", post(renew_session))
        .route("/:session_id/timeout", patch(update_session_timeout))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    agent_id: String,
    user_id: String,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    timeout_config: Option<TimeoutConfigPatch>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Response, ApiError> {
    let agent_id = validate::parse_id("agentId", &body.agent_id)?;
    let user_id = validate::parse_id("userId", &body.user_id)?;
    validate::validate_metadata(body.metadata.as_ref())?;

    let view = state
        .sessions
        .create(agent_id, user_id, body.metadata, body.timeout_config)
        .await?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.sessions.list();
    let total = sessions.len();
    Json(json!({
        "success": true,
        "data": { "sessions": sessions, "total": total },
    }))
}

async fn sessions_health(State(state): State<AppState>) -> Json<Value> {
    Json(state.sessions.health())
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = validate::parse_id("sessionId", &session_id)?;
    let view = state.sessions.get(session_id)?;
    Ok(Json(serde_json::to_value(view).unwrap_or(Value::Null)))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = validate::parse_id("sessionId", &session_id)?;
    state.sessions.delete(session_id)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    content: String,
    #[serde(default)]
    attachments: Option<Value>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    transport: Option<String>,
    /// Legacy spelling of `transport`.
    #[serde(default)]
    mode: Option<String>,
}

async fn send_session_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<Response, ApiError> {
    let session_id = validate::parse_id("sessionId", &session_id)?;
    let transport = Transport::parse(body.transport.as_deref().or(body.mode.as_deref()))?;

    let sent = state
        .sessions
        .send_message(session_id, body.content.clone(), body.attachments, body.metadata)
        .await?;

    let input = AgentInput {
        entity_id: sent.user_id,
        room_id: sent.channel_id,
        world_id: Some(state.service.current_server_id()),
        content: body.content,
        source: sent.message.source_type.clone(),
        message_id: Some(sent.message.id),
        display_name: None,
        metadata: sent.message.metadata.clone().unwrap_or(Value::Null),
    };

    let extra = json!({
        "sessionStatus": sent.status,
    });

    Ok(transport::dispatch(
        transport,
        &state.registry,
        sent.agent_id,
        &sent.message,
        input,
        Some(extra),
    )
    .await)
}

#[derive(Debug, Deserialize)]
struct SessionMessagesQuery {
    #[serde(default)]
    limit: Option<Value>,
    #[serde(default)]
    before: Option<String>,
    #[serde(default)]
    after: Option<String>,
}

fn parse_cursor(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(raw) = raw else { return Ok(None) };
    let millis: i64 = raw.trim().parse().map_err(|_| {
        ApiError::new(
            ErrorCode::InvalidPagination,
            format!("{field} must be a millisecond timestamp"),
        )
    })?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(Some)
        .ok_or_else(|| {
            ApiError::new(ErrorCode::InvalidPagination, format!("{field} is out of range"))
        })
}

async fn get_session_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<SessionMessagesQuery>,
) -> Result<Json<Value>, ApiError> {
    let session_id = validate::parse_id("sessionId", &session_id)?;
    #[allow(clippy::cast_sign_loss)]
    let limit = validate::clamp_i64("limit", query.limit.as_ref(), 50, 1, 100) as usize;
    let before = parse_cursor("before", query.before.as_deref())?;
    let after = parse_cursor("after", query.after.as_deref())?;

    let page = state
        .sessions
        .get_messages(session_id, Some(limit), before, after)?;
    Ok(Json(json!({
        "success": true,
        "data": page,
    })))
}

async fn session_heartbeat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = validate::parse_id("sessionId", &session_id)?;
    let view = state.sessions.heartbeat(session_id)?;
    Ok(Json(json!({
        "success": true,
        "data": view,
    })))
}

async fn renew_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = validate::parse_id("sessionId", &session_id)?;
    let view = state.sessions.renew(session_id)?;
    Ok(Json(json!({
        "success": true,
        "data": view,
    })))
}

async fn update_session_timeout(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(patch): Json<TimeoutConfigPatch>,
) -> Result<Json<Value>, ApiError> {
    let session_id = validate::parse_id("sessionId", &session_id)?;
    let view = state.sessions.update_timeout(session_id, &patch)?;
    Ok(Json(json!({
        "success": true,
        "data": view,
    })))
}
