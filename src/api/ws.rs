//! WebSocket endpoint: authenticated handshake, room membership, message
//! ingestion, and log stream control frames.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

use super::AppState;
use crate::error::{ApiError, ErrorCode};
use crate::messages::PostMessage;
use crate::socket::protocol::{
    ClientFrame, ClientMessageType, LogFilterPayload, RoomJoiningPayload, SendMessagePayload,
    EVT_AUTHENTICATED, EVT_CHANNEL_JOINED, EVT_CONNECTION_ESTABLISHED, EVT_LOG_FILTERS_UPDATED,
    EVT_LOG_SUBSCRIPTION_CONFIRMED, EVT_MESSAGE_ACK, EVT_ROOM_JOINED,
};
use crate::socket::{message_error, LogFilter, Outbound};
use crate::validate;

#[derive(Debug, Deserialize)]
pub(crate) struct WsAuthQuery {
    #[serde(default, alias = "apiKey")]
    api_key: Option<String>,
    #[serde(default, alias = "entityId")]
    entity_id: Option<String>,
}

/// Handshake: API key (when configured) and a well-formed entity id, both
/// checked before the upgrade completes.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(auth): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(expected) = &state.config.auth_token {
        let from_header = headers.get("x-api-key").and_then(|v| v.to_str().ok());
        let provided = auth.api_key.as_deref().or(from_header);
        if provided != Some(expected.as_str()) {
            return ApiError::new(ErrorCode::MissingApiKey, "missing or invalid API key")
                .into_response();
        }
    }

    let entity_id = match auth
        .entity_id
        .as_deref()
        .ok_or_else(|| ApiError::new(ErrorCode::MissingFields, "entityId is required"))
        .and_then(|raw| validate::parse_id("entityId", raw))
    {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(state, socket, entity_id))
}

/// Per-socket state: the entity behind the connection and its lazily
/// populated allowed-rooms cache.
struct ConnState {
    socket_id: Uuid,
    entity_id: Uuid,
    allowed_rooms: HashSet<Uuid>,
}

async fn handle_socket(state: AppState, socket: WebSocket, entity_id: Uuid) {
    let (socket_id, mut outbound) = state.hub.register(entity_id);
    let (mut sink, mut stream) = socket.split();

    // Writer: drain hub frames into the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    state.hub.emit_to(
        socket_id,
        Outbound::new(
            EVT_CONNECTION_ESTABLISHED,
            json!({ "socketId": socket_id.to_string() }),
        ),
    );
    state.hub.emit_to(
        socket_id,
        Outbound::new(
            EVT_AUTHENTICATED,
            json!({ "entityId": entity_id.to_string() }),
        ),
    );
    tracing::info!(socket_id = %socket_id, entity_id = %entity_id, "socket connected");

    let mut conn = ConnState {
        socket_id,
        entity_id,
        allowed_rooms: HashSet::new(),
    };

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            state
                .hub
                .emit_to(socket_id, message_error("malformed frame", ErrorCode::InvalidContent.as_str()));
            continue;
        };
        let Some(message_type) = ClientMessageType::parse(&frame.tag) else {
            state
                .hub
                .emit_to(socket_id, message_error("unknown message type", ErrorCode::InvalidContent.as_str()));
            continue;
        };

        match message_type {
            ClientMessageType::RoomJoining => {
                let payload: RoomJoiningPayload =
                    serde_json::from_value(frame.payload).unwrap_or_default();
                handle_room_joining(&state, &mut conn, payload).await;
            }
            ClientMessageType::SendMessage => {
                let payload: SendMessagePayload =
                    serde_json::from_value(frame.payload).unwrap_or_default();
                handle_send_message(&state, &conn, payload).await;
            }
            ClientMessageType::SubscribeLogs => {
                let payload: LogFilterPayload =
                    serde_json::from_value(frame.payload).unwrap_or_default();
                let filter = parse_log_filter(&payload);
                state.hub.subscribe_logs(socket_id, filter);
                state.hub.emit_to(
                    socket_id,
                    Outbound::new(
                        EVT_LOG_SUBSCRIPTION_CONFIRMED,
                        json!({ "subscribed": true }),
                    ),
                );
            }
            ClientMessageType::UnsubscribeLogs => {
                state.hub.unsubscribe_logs(socket_id);
                state.hub.emit_to(
                    socket_id,
                    Outbound::new(
                        EVT_LOG_SUBSCRIPTION_CONFIRMED,
                        json!({ "subscribed": false }),
                    ),
                );
            }
            ClientMessageType::UpdateLogFilters => {
                let payload: LogFilterPayload =
                    serde_json::from_value(frame.payload).unwrap_or_default();
                let updated = state
                    .hub
                    .update_log_filters(socket_id, parse_log_filter(&payload));
                state.hub.emit_to(
                    socket_id,
                    Outbound::new(EVT_LOG_FILTERS_UPDATED, json!({ "success": updated })),
                );
            }
        }
    }

    state.hub.unregister(socket_id);
    writer.abort();
    tracing::info!(socket_id = %socket_id, entity_id = %entity_id, "socket disconnected");
}

async fn handle_room_joining(state: &AppState, conn: &mut ConnState, payload: RoomJoiningPayload) {
    let Some(raw_channel) = payload.channel() else {
        state.hub.emit_to(
            conn.socket_id,
            message_error("channelId is required", ErrorCode::InvalidChannelId.as_str()),
        );
        return;
    };
    let channel_id = match validate::parse_channel_id(raw_channel) {
        Ok(id) => id,
        Err(err) => {
            state
                .hub
                .emit_to(conn.socket_id, message_error(&err.message, err.code.as_str()));
            return;
        }
    };

    // Data isolation: the entity must be a channel participant. The
    // allowed-rooms cache fills lazily on join attempts.
    if state.config.data_isolation && !conn.allowed_rooms.contains(&channel_id) {
        match state
            .service
            .store()
            .is_participant(channel_id, conn.entity_id)
        {
            Ok(true) => {
                conn.allowed_rooms.insert(channel_id);
            }
            Ok(false) => {
                state.hub.emit_to(
                    conn.socket_id,
                    message_error("not a participant of this channel", ErrorCode::AccessDeniedChannel.as_str()),
                );
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "participant check failed");
                state.hub.emit_to(
                    conn.socket_id,
                    message_error("channel access check failed", ErrorCode::PersistenceError.as_str()),
                );
                return;
            }
        }
    }

    state.hub.join_room(conn.socket_id, channel_id);
    if let Some(agent_id) = payload
        .agent_id
        .as_deref()
        .and_then(|raw| Uuid::try_parse(raw).ok())
    {
        state.hub.associate_agent(conn.socket_id, agent_id);
    }

    let joined = json!({
        "channelId": channel_id.to_string(),
        "roomId": channel_id.to_string(),
        "entityId": conn.entity_id.to_string(),
    });
    state
        .hub
        .emit_to(conn.socket_id, Outbound::new(EVT_CHANNEL_JOINED, joined.clone()));
    // Mirror for older clients.
    state
        .hub
        .emit_to(conn.socket_id, Outbound::new(EVT_ROOM_JOINED, joined));

    notify_entity_joined(state, conn, channel_id, &payload).await;
}

/// Tell the first available runtime that an entity entered a room, so the
/// agent side can set up its world/room/entity records.
async fn notify_entity_joined(
    state: &AppState,
    conn: &ConnState,
    channel_id: Uuid,
    payload: &RoomJoiningPayload,
) {
    let entity_id = payload
        .entity_id
        .as_deref()
        .and_then(|raw| Uuid::try_parse(raw).ok())
        .unwrap_or(conn.entity_id);

    let channel = state.service.get_channel(channel_id).ok();
    let world_id = payload
        .message_server_id
        .as_deref()
        .and_then(|raw| Uuid::try_parse(raw).ok())
        .or_else(|| channel.as_ref().map(|c| c.message_server_id));
    let Some(world_id) = world_id else { return };

    let channel_type = channel
        .map(|c| c.channel_type)
        .unwrap_or(crate::db::ChannelType::Group);

    if let Some(runtime) = state.registry.first().await {
        if let Err(err) = runtime
            .ensure_connection(entity_id, channel_id, world_id, channel_type, None)
            .await
        {
            tracing::warn!(error = %err, "entity join notification failed");
        }
    }
}

async fn handle_send_message(state: &AppState, conn: &ConnState, payload: SendMessagePayload) {
    let Some(raw_channel) = payload.channel() else {
        state.hub.emit_to(
            conn.socket_id,
            message_error("channelId is required", ErrorCode::InvalidChannelId.as_str()),
        );
        return;
    };
    let channel_id = match validate::parse_channel_id(raw_channel) {
        Ok(id) => id,
        Err(err) => {
            state
                .hub
                .emit_to(conn.socket_id, message_error(&err.message, err.code.as_str()));
            return;
        }
    };

    let Some(content) = payload.message.as_deref().filter(|m| !m.trim().is_empty()) else {
        state.hub.emit_to(
            conn.socket_id,
            message_error("message must not be empty", ErrorCode::InvalidContent.as_str()),
        );
        return;
    };

    let sender_id = payload
        .sender_id
        .as_deref()
        .and_then(|raw| Uuid::try_parse(raw).ok())
        .unwrap_or(conn.entity_id);
    let server_id = payload
        .server()
        .and_then(|raw| Uuid::try_parse(raw).ok())
        .unwrap_or_else(|| state.service.current_server_id());

    // Carry the DM hints through so auto-creation derives the right type
    // and participant pair.
    let mut metadata = match payload.metadata.clone() {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    if let Some(target) = payload.resolve_target_user() {
        metadata
            .entry("targetUserId".to_string())
            .or_insert_with(|| Value::String(target.to_string()));
    }
    if let Some(attachments) = payload.attachments.clone() {
        metadata.insert("attachments".to_string(), attachments);
    }

    let result = state
        .service
        .post_message(PostMessage {
            channel_id,
            author_id: sender_id,
            message_server_id: server_id,
            content: content.to_string(),
            in_reply_to_message_id: None,
            raw_message: None,
            metadata: Some(Value::Object(metadata)),
            source_type: Some("websocket".to_string()),
            source_id: payload.message_id.clone(),
            author_display_name: payload.sender_name.clone(),
        })
        .await;

    match result {
        Ok(message) => {
            state.hub.emit_to(
                conn.socket_id,
                Outbound::new(
                    EVT_MESSAGE_ACK,
                    json!({
                        "clientMessageId": payload.message_id,
                        "messageId": message.id.to_string(),
                        "status": "received",
                    }),
                ),
            );
        }
        Err(err) => {
            state
                .hub
                .emit_to(conn.socket_id, message_error(&err.message, err.code.as_str()));
        }
    }
}

/// Accepts numeric levels and the usual level names.
fn parse_log_filter(payload: &LogFilterPayload) -> LogFilter {
    let level = match &payload.level {
        Some(Value::Number(n)) => n
            .as_i64()
            .map(|v| v.clamp(0, 255))
            .and_then(|v| u8::try_from(v).ok())
            .unwrap_or(LogFilter::default().level),
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "trace" => 10,
            "debug" => 20,
            "info" => 30,
            "warn" | "warning" => 40,
            "error" => 50,
            _ => LogFilter::default().level,
        },
        _ => LogFilter::default().level,
    };
    LogFilter {
        agent_name: payload.agent_name.clone().filter(|s| !s.is_empty()),
        level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_parsing_accepts_numbers_and_names() {
        let numeric = parse_log_filter(&LogFilterPayload {
            agent_name: Some("ada".to_string()),
            level: Some(json!(40)),
        });
        assert_eq!(numeric.level, 40);
        assert_eq!(numeric.agent_name.as_deref(), Some("ada"));

        let named = parse_log_filter(&LogFilterPayload {
            agent_name: None,
            level: Some(json!("error")),
        });
        assert_eq!(named.level, 50);

        let junk = parse_log_filter(&LogFilterPayload {
            agent_name: Some(String::new()),
            level: Some(json!("loudest")),
        });
        assert_eq!(junk.level, LogFilter::default().level);
        assert!(junk.agent_name.is_none());
    }
}
