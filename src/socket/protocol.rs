//! Socket wire protocol: client frame parsing and server event names.
//!
//! Clients send either numeric-tagged frames (`1` = room joining, `2` =
//! send message) or `{type, payload}` envelopes with string tags. Server
//! events are `{event, data}` JSON texts.

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

// Server → client event names.
pub const EVT_CONNECTION_ESTABLISHED: &str = "connection_established";
pub const EVT_AUTHENTICATED: &str = "authenticated";
pub const EVT_CHANNEL_JOINED: &str = "channel_joined";
pub const EVT_ROOM_JOINED: &str = "room_joined";
pub const EVT_MESSAGE_BROADCAST: &str = "messageBroadcast";
pub const EVT_MESSAGE_ACK: &str = "messageAck";
pub const EVT_MESSAGE_ERROR: &str = "messageError";
pub const EVT_MESSAGE_DELETED: &str = "messageDeleted";
pub const EVT_CHANNEL_CLEARED: &str = "channelCleared";
pub const EVT_CHANNEL_UPDATED: &str = "channelUpdated";
pub const EVT_CHANNEL_DELETED: &str = "channelDeleted";
pub const EVT_STREAM_CHUNK: &str = "messageStreamChunk";
pub const EVT_STREAM_ERROR: &str = "messageStreamError";
pub const EVT_LOG_STREAM: &str = "log_stream";
pub const EVT_LOG_SUBSCRIPTION_CONFIRMED: &str = "log_subscription_confirmed";
pub const EVT_LOG_FILTERS_UPDATED: &str = "log_filters_updated";

/// Parsed client intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessageType {
    RoomJoining,
    SendMessage,
    SubscribeLogs,
    UnsubscribeLogs,
    UpdateLogFilters,
}

impl ClientMessageType {
    /// Accepts the numeric tags (`1`, `2`) and their string spellings.
    pub fn parse(tag: &Value) -> Option<Self> {
        match tag {
            Value::Number(n) => match n.as_i64() {
                Some(1) => Some(Self::RoomJoining),
                Some(2) => Some(Self::SendMessage),
                _ => None,
            },
            Value::String(s) => match s.as_str() {
                "1" | "ROOM_JOINING" | "room_joining" => Some(Self::RoomJoining),
                "2" | "SEND_MESSAGE" | "send_message" => Some(Self::SendMessage),
                "subscribe_logs" => Some(Self::SubscribeLogs),
                "unsubscribe_logs" => Some(Self::UnsubscribeLogs),
                "update_log_filters" => Some(Self::UpdateLogFilters),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Raw inbound frame.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub tag: Value,
    #[serde(default)]
    pub payload: Value,
}

/// Payload of a `ROOM_JOINING` frame. `roomId` is the legacy spelling of
/// `channelId`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoiningPayload {
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub message_server_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl RoomJoiningPayload {
    pub fn channel(&self) -> Option<&str> {
        self.channel_id.as_deref().or(self.room_id.as_deref())
    }
}

/// Payload of a `SEND_MESSAGE` frame.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub message_server_id: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub attachments: Option<Value>,
    #[serde(default)]
    pub target_user_id: Option<String>,
    /// Client-generated id echoed back in the ack.
    #[serde(default)]
    pub message_id: Option<String>,
}

impl SendMessagePayload {
    pub fn channel(&self) -> Option<&str> {
        self.channel_id.as_deref().or(self.room_id.as_deref())
    }

    pub fn server(&self) -> Option<&str> {
        self.message_server_id
            .as_deref()
            .or(self.server_id.as_deref())
    }

    /// The second DM participant: explicit field first, then metadata.
    pub fn resolve_target_user(&self) -> Option<Uuid> {
        let from_meta = |key: &str| {
            self.metadata
                .as_ref()
                .and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .and_then(|s| Uuid::try_parse(s).ok())
        };
        self.target_user_id
            .as_deref()
            .and_then(|s| Uuid::try_parse(s).ok())
            .or_else(|| from_meta("targetUserId"))
            .or_else(|| from_meta("recipientId"))
    }
}

/// Payload of the log-stream control frames.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilterPayload {
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub level: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_and_string_tags_parse() {
        assert_eq!(
            ClientMessageType::parse(&json!(1)),
            Some(ClientMessageType::RoomJoining)
        );
        assert_eq!(
            ClientMessageType::parse(&json!(2)),
            Some(ClientMessageType::SendMessage)
        );
        assert_eq!(
            ClientMessageType::parse(&json!("SEND_MESSAGE")),
            Some(ClientMessageType::SendMessage)
        );
        assert_eq!(
            ClientMessageType::parse(&json!("subscribe_logs")),
            Some(ClientMessageType::SubscribeLogs)
        );
        assert_eq!(ClientMessageType::parse(&json!(99)), None);
        assert_eq!(ClientMessageType::parse(&json!(null)), None);
    }

    #[test]
    fn room_id_is_channel_alias() {
        let payload: RoomJoiningPayload =
            serde_json::from_value(json!({"roomId": "abc"})).unwrap();
        assert_eq!(payload.channel(), Some("abc"));

        let both: RoomJoiningPayload =
            serde_json::from_value(json!({"channelId": "one", "roomId": "two"})).unwrap();
        assert_eq!(both.channel(), Some("one"));
    }

    #[test]
    fn target_user_resolution_order() {
        let explicit_id = Uuid::new_v4();
        let meta_id = Uuid::new_v4();
        let payload: SendMessagePayload = serde_json::from_value(json!({
            "targetUserId": explicit_id.to_string(),
            "metadata": {"recipientId": meta_id.to_string()}
        }))
        .unwrap();
        assert_eq!(payload.resolve_target_user(), Some(explicit_id));

        let meta_only: SendMessagePayload = serde_json::from_value(json!({
            "metadata": {"recipientId": meta_id.to_string()}
        }))
        .unwrap();
        assert_eq!(meta_only.resolve_target_user(), Some(meta_id));

        let none: SendMessagePayload = serde_json::from_value(json!({})).unwrap();
        assert_eq!(none.resolve_target_user(), None);
    }
}
