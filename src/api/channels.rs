//! Channel and message routes.

use axum::extract::{Multipart, Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{AppState, ClientIp};
use crate::db::{ChannelPatch, ChannelType, NewChannel};
use crate::error::{ApiError, ErrorCode};
use crate::messages::PostMessage;
use crate::runtime::AgentInput;
use crate::transport::{self, Transport};
use crate::validate;

/// Upload cap per file.
const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

const ALLOWED_MIME_TYPES: [&str; 11] = [
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "audio/mpeg",
    "audio/wav",
    "audio/ogg",
    "video/mp4",
    "video/webm",
    "application/pdf",
    "text/plain",
];

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_channel))
        .route(
            "/:channel_id/messages",
            post(post_message).get(get_messages).delete(clear_channel),
        )
        .route("/:channel_id/messages/:message_id", delete(delete_message))
        .route("/:channel_id/details", get(get_details))
        .route("/:channel_id/participants", get(get_participants))
        .route("/:channel_id/agents", get(get_agents).post(add_agent))
        .route("/:channel_id/agents/:agent_id", delete(remove_agent))
        .route("/:channel_id", patch(update_channel).delete(delete_channel))
        .route("/:channel_id/upload-media", post(upload_media))
        .route("/:channel_id/generate-title", post(generate_title))
}

fn data_response(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Channel-id validation with the failure-only rate limit profile.
fn checked_channel_id(
    raw: &str,
    state: &AppState,
    client: Option<ClientIp>,
) -> Result<Uuid, ApiError> {
    let ip = client.and_then(|c| c.0);
    if let Some(ip) = ip {
        if state.rate_limits.channel_validation.is_blocked(ip) {
            return Err(ApiError::new(
                ErrorCode::RateLimitExceeded,
                "too many invalid channel ids",
            ));
        }
    }
    match validate::parse_channel_id(raw) {
        Ok(id) => Ok(id),
        Err(err) => {
            if let Some(ip) = ip {
                state.rate_limits.channel_validation.record_failure(ip);
            }
            Err(err)
        }
    }
}

/// First channel participant with a live runtime; the agent a sync or
/// streaming dispatch will call.
async fn resolve_channel_agent(state: &AppState, channel_id: Uuid) -> Option<Uuid> {
    let participants = state.service.list_participants(channel_id).ok()?;
    for participant in participants {
        if state.registry.contains(participant).await {
            return Some(participant);
        }
    }
    None
}

// ==================== Message Ingestion ====================

/// Body of `POST /channels/:channelId/messages`. Snake-cased: this is the
/// same shape agent connectors submit over the wire.
#[derive(Debug, Deserialize)]
struct PostMessageBody {
    author_id: String,
    content: String,
    message_server_id: String,
    #[serde(default)]
    in_reply_to_message_id: Option<String>,
    #[serde(default)]
    raw_message: Option<Value>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    source_type: Option<String>,
    #[serde(default)]
    user_display_name: Option<String>,
    #[serde(default)]
    transport: Option<String>,
    /// Legacy spelling of `transport`.
    #[serde(default)]
    mode: Option<String>,
}

async fn post_message(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    client: Option<Extension<ClientIp>>,
    Json(body): Json<PostMessageBody>,
) -> Result<Response, ApiError> {
    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    let author_id = validate::parse_id("author_id", &body.author_id)?;
    let message_server_id = validate::parse_id("message_server_id", &body.message_server_id)?;
    let in_reply_to = validate::parse_optional_id(
        "in_reply_to_message_id",
        body.in_reply_to_message_id.as_deref(),
    )?;
    let transport = Transport::parse(body.transport.as_deref().or(body.mode.as_deref()))?;

    // A raw_message that fails to parse degrades to nothing, never an error.
    let raw_message = body.raw_message.and_then(|raw| match raw {
        Value::String(s) => serde_json::from_str(&s).ok(),
        other @ Value::Object(_) => Some(other),
        _ => None,
    });

    let message = state
        .service
        .post_message(PostMessage {
            channel_id,
            author_id,
            message_server_id,
            content: body.content.clone(),
            in_reply_to_message_id: in_reply_to,
            raw_message,
            metadata: body.metadata,
            source_type: body.source_type,
            source_id: None,
            author_display_name: body.user_display_name,
        })
        .await?;

    let agent_id = match transport {
        Transport::Websocket => None,
        _ => Some(
            resolve_channel_agent(&state, channel_id)
                .await
                .ok_or_else(|| {
                    ApiError::new(ErrorCode::AgentNotFound, "no agent available in this channel")
                })?,
        ),
    };

    let input = AgentInput {
        entity_id: author_id,
        room_id: channel_id,
        world_id: Some(message_server_id),
        content: body.content,
        source: message.source_type.clone(),
        message_id: Some(message.id),
        display_name: None,
        metadata: message.metadata.clone().unwrap_or(Value::Null),
    };

    Ok(transport::dispatch(
        transport,
        &state.registry,
        agent_id.unwrap_or(author_id),
        &message,
        input,
        None,
    )
    .await)
}

#[derive(Debug, Deserialize)]
struct GetMessagesQuery {
    #[serde(default)]
    limit: Option<Value>,
    #[serde(default)]
    before: Option<String>,
}

fn parse_before(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(raw) = raw else { return Ok(None) };
    let millis: i64 = raw.trim().parse().map_err(|_| {
        ApiError::new(ErrorCode::InvalidPagination, "before must be a millisecond timestamp")
    })?;
    Utc.timestamp_millis_opt(millis).single().map(Some).ok_or_else(|| {
        ApiError::new(ErrorCode::InvalidPagination, "before is out of range")
    })
}

async fn get_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    client: Option<Extension<ClientIp>>,
    Query(query): Query<GetMessagesQuery>,
) -> Result<Json<Value>, ApiError> {
    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    #[allow(clippy::cast_sign_loss)]
    let limit = validate::clamp_i64("limit", query.limit.as_ref(), 50, 1, 1000) as usize;
    let before = parse_before(query.before.as_deref())?;

    let messages = state.service.get_messages(channel_id, Some(limit), before)?;
    Ok(data_response(json!({
        "messages": messages,
    })))
}

// ==================== Channel CRUD ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChannelBody {
    name: String,
    #[serde(default, alias = "serverId")]
    message_server_id: Option<String>,
    #[serde(default, alias = "participantCentralUserIds")]
    participant_ids: Vec<String>,
    #[serde(default, rename = "type")]
    channel_type: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn create_channel(
    State(state): State<AppState>,
    Json(body): Json<CreateChannelBody>,
) -> Result<Response, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::MissingFields, "name is required"));
    }
    validate::validate_metadata(body.metadata.as_ref())?;

    let server_id = match body.message_server_id.as_deref() {
        Some(raw) => validate::parse_id("messageServerId", raw)?,
        None => state.service.current_server_id(),
    };
    state.service.check_server_scope(server_id)?;

    let mut participants = Vec::new();
    for raw in &body.participant_ids {
        participants.push(validate::parse_id("participantCentralUserIds", raw)?);
    }

    let channel_type = body
        .channel_type
        .as_deref()
        .map_or(ChannelType::Group, ChannelType::parse);
    if channel_type == ChannelType::Dm && participants.len() != 2 {
        return Err(ApiError::new(
            ErrorCode::InvalidId,
            "a DM channel requires exactly two participants",
        ));
    }
    if channel_type == ChannelType::Group && participants.is_empty() {
        return Err(ApiError::new(
            ErrorCode::MissingFields,
            "a group channel requires at least one participant",
        ));
    }

    let channel = state.service.store().create_channel(&NewChannel {
        id: None,
        message_server_id: server_id,
        name: body.name,
        channel_type,
        source_type: Some("api".to_string()),
        topic: None,
        metadata: body.metadata,
        participants,
    })?;

    Ok((
        axum::http::StatusCode::CREATED,
        data_response(json!({ "channel": channel })),
    )
        .into_response())
}

async fn get_details(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    client: Option<Extension<ClientIp>>,
) -> Result<Json<Value>, ApiError> {
    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    let channel = state.service.get_channel(channel_id)?;
    let participant_count = state.service.list_participants(channel_id)?.len();
    Ok(data_response(json!({
        "channel": channel,
        "participantCount": participant_count,
    })))
}

async fn get_participants(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    client: Option<Extension<ClientIp>>,
) -> Result<Json<Value>, ApiError> {
    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    let participants = state.service.list_participants(channel_id)?;
    Ok(data_response(json!({ "participants": participants })))
}

/// Agents in a channel: the participant set intersected with the server's
/// agent roster.
async fn get_agents(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    client: Option<Extension<ClientIp>>,
) -> Result<Json<Value>, ApiError> {
    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    let channel = state.service.get_channel(channel_id)?;
    let participants = state.service.list_participants(channel_id)?;
    let server_agents = state
        .service
        .store()
        .list_agents_for_server(channel.message_server_id)?;

    let agents: Vec<Uuid> = participants
        .into_iter()
        .filter(|p| server_agents.contains(p))
        .collect();
    Ok(data_response(json!({ "agents": agents })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddAgentBody {
    agent_id: String,
}

async fn add_agent(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    client: Option<Extension<ClientIp>>,
    Json(body): Json<AddAgentBody>,
) -> Result<Response, ApiError> {
    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    let agent_id = validate::parse_id("agentId", &body.agent_id)?;
    state.service.add_participants(channel_id, &[agent_id])?;
    Ok((
        axum::http::StatusCode::CREATED,
        data_response(json!({ "channelId": channel_id, "agentId": agent_id })),
    )
        .into_response())
}

async fn remove_agent(
    State(state): State<AppState>,
    Path((channel_id, agent_id)): Path<(String, String)>,
    client: Option<Extension<ClientIp>>,
) -> Result<Json<Value>, ApiError> {
    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    let agent_id = validate::parse_id("agentId", &agent_id)?;
    state.service.remove_participant(channel_id, agent_id)?;
    Ok(data_response(json!({ "removed": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateChannelBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn update_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    client: Option<Extension<ClientIp>>,
    Json(body): Json<UpdateChannelBody>,
) -> Result<Json<Value>, ApiError> {
    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    validate::validate_metadata(body.metadata.as_ref())?;
    let channel = state.service.update_channel(
        channel_id,
        &ChannelPatch {
            name: body.name,
            topic: body.topic,
            metadata: body.metadata,
        },
    )?;
    Ok(data_response(json!({ "channel": channel })))
}

async fn delete_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    client: Option<Extension<ClientIp>>,
) -> Result<Json<Value>, ApiError> {
    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    state.service.delete_channel(channel_id)?;
    Ok(data_response(json!({ "deleted": true })))
}

async fn delete_message(
    State(state): State<AppState>,
    Path((channel_id, message_id)): Path<(String, String)>,
    client: Option<Extension<ClientIp>>,
) -> Result<Json<Value>, ApiError> {
    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    let message_id = validate::parse_id("messageId", &message_id)?;
    state.service.delete_message(channel_id, message_id).await?;
    Ok(data_response(json!({ "deleted": true })))
}

async fn clear_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    client: Option<Extension<ClientIp>>,
) -> Result<Json<Value>, ApiError> {
    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    let deleted = state.service.clear_channel(channel_id).await?;
    Ok(data_response(json!({ "deleted": deleted })))
}

// ==================== Uploads ====================

async fn upload_media(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    client: Option<Extension<ClientIp>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let ip = client.as_ref().and_then(|e| e.0 .0);
    if let Some(ip) = ip {
        if !state.rate_limits.uploads.check(ip) {
            return Err(ApiError::new(
                ErrorCode::UploadRateLimitExceeded,
                "upload rate limit exceeded",
            ));
        }
    }

    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    let _ = state.service.get_channel(channel_id)?;

    let field = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::new(ErrorCode::InvalidContentType, "malformed multipart body"))?
        .ok_or_else(|| ApiError::new(ErrorCode::MissingFields, "no file in upload"))?;

    let original_name = field.file_name().unwrap_or("upload").to_string();
    let filename = validate::sanitize_filename(&original_name);
    let declared_mime = field.content_type().map(str::to_string);

    let data = field
        .bytes()
        .await
        .map_err(|_| ApiError::new(ErrorCode::InvalidContent, "failed to read upload"))?;
    if data.len() > MAX_FILE_SIZE {
        return Err(ApiError::new(
            ErrorCode::ContentTooLarge,
            format!("file exceeds {MAX_FILE_SIZE} bytes"),
        ));
    }

    let mime = declared_mime.unwrap_or_else(|| {
        mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    });
    if !ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
        return Err(ApiError::new(
            ErrorCode::InvalidContentType,
            format!("MIME type {mime} is not allowed"),
        ));
    }

    if let Some(ip) = ip {
        if !state.rate_limits.files.check(ip) {
            return Err(ApiError::new(
                ErrorCode::FileRateLimitExceeded,
                "file write rate limit exceeded",
            ));
        }
    }

    let dir = std::path::Path::new(&state.config.uploads_dir).join(channel_id.to_string());
    tokio::fs::create_dir_all(&dir).await.map_err(|err| {
        tracing::error!(error = %err, "failed to create upload directory");
        ApiError::new(ErrorCode::PersistenceError, "upload storage unavailable")
    })?;

    let stored_name = format!("{}-{filename}", Uuid::new_v4());
    let path = dir.join(&stored_name);
    tokio::fs::write(&path, &data).await.map_err(|err| {
        tracing::error!(error = %err, "failed to write upload");
        ApiError::new(ErrorCode::PersistenceError, "upload storage unavailable")
    })?;

    Ok((
        axum::http::StatusCode::CREATED,
        data_response(json!({
            "url": format!("/media/uploads/channels/{channel_id}/{stored_name}"),
            "filename": stored_name,
            "originalName": original_name,
            "mimeType": mime,
            "size": data.len(),
        })),
    )
        .into_response())
}

// ==================== Title Generation ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateTitleBody {
    agent_id: String,
}

async fn generate_title(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    client: Option<Extension<ClientIp>>,
    Json(body): Json<GenerateTitleBody>,
) -> Result<Json<Value>, ApiError> {
    let channel_id = checked_channel_id(&channel_id, &state, client.map(|e| e.0))?;
    let agent_id = validate::parse_id("agentId", &body.agent_id)?;
    let title = state
        .service
        .generate_title(channel_id, agent_id, &state.registry)
        .await?;
    Ok(data_response(json!({ "title": title })))
}
