//! Channel/message service: channel auto-creation, message persistence,
//! bus publication, and socket fanout.
//!
//! For a given inbound message the order is fixed: persist, then publish
//! `new_message` on the bus, then broadcast `messageBroadcast` to the
//! channel room. Responses from concurrent agents may interleave, but this
//! chain never reorders.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::bus::{MessageBus, Topic};
use crate::db::{Channel, ChannelPatch, ChannelType, Message, NewChannel, NewMessage, Store};
use crate::error::{ApiError, ErrorCode};
use crate::runtime::RuntimeRegistry;
use crate::socket::{protocol, Outbound, SocketHub};
use crate::validate;

/// Hard cap on messages returned per call, whatever the client asks for.
pub const MAX_MESSAGES_PER_PAGE: usize = 1000;
pub const DEFAULT_MESSAGES_PAGE: usize = 50;

/// Messages deleted per batch while clearing a channel.
const CLEAR_BATCH_SIZE: usize = 500;

/// Minimum transcript length before a title can be generated.
const TITLE_MIN_MESSAGES: usize = 4;

/// Inputs for [`MessageService::post_message`].
#[derive(Debug, Clone)]
pub struct PostMessage {
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub message_server_id: Uuid,
    pub content: String,
    pub in_reply_to_message_id: Option<Uuid>,
    pub raw_message: Option<Value>,
    pub metadata: Option<Value>,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub author_display_name: Option<String>,
}

pub struct MessageService {
    store: Store,
    bus: Arc<MessageBus>,
    hub: Arc<SocketHub>,
    current_server_id: Uuid,
}

impl MessageService {
    pub fn new(store: Store, bus: Arc<MessageBus>, hub: Arc<SocketHub>, current_server_id: Uuid) -> Self {
        Self {
            store,
            bus,
            hub,
            current_server_id,
        }
    }

    pub fn current_server_id(&self) -> Uuid {
        self.current_server_id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Row-level isolation: every mutating message-scoped call must name
    /// the current server.
    pub fn check_server_scope(&self, message_server_id: Uuid) -> Result<(), ApiError> {
        if message_server_id != self.current_server_id {
            return Err(ApiError::new(
                ErrorCode::ForbiddenServerMismatch,
                "messageServerId does not match the current server",
            ));
        }
        Ok(())
    }

    /// Persist a message, publish it on the bus, and broadcast it to the
    /// channel room. Auto-creates the channel on first contact.
    pub async fn post_message(&self, post: PostMessage) -> Result<Message, ApiError> {
        self.check_server_scope(post.message_server_id)?;
        validate::validate_content(&post.content)?;
        validate::validate_metadata(post.metadata.as_ref())?;

        self.ensure_channel(
            post.channel_id,
            post.author_id,
            post.message_server_id,
            post.metadata.as_ref(),
        )?;

        let mut metadata = as_object(post.metadata.clone());
        if let Some(name) = &post.author_display_name {
            metadata
                .entry("user_display_name".to_string())
                .or_insert_with(|| Value::String(name.clone()));
        }

        let message = self.store.create_message(&NewMessage {
            channel_id: post.channel_id,
            author_id: post.author_id,
            content: post.content.clone(),
            raw_message: post.raw_message.clone(),
            source_type: post.source_type.clone(),
            source_id: post.source_id.clone(),
            in_reply_to_root_message_id: post.in_reply_to_message_id,
            metadata: Some(Value::Object(metadata)),
        })?;

        self.bus
            .publish(
                Topic::NewMessage,
                bus_envelope(&message, self.current_server_id, post.author_display_name.as_deref()),
            )
            .await;

        self.hub.broadcast_to_room(
            message.channel_id,
            &Outbound::new(
                protocol::EVT_MESSAGE_BROADCAST,
                broadcast_payload(&message, self.current_server_id, post.author_display_name.as_deref()),
            ),
            None,
        );

        Ok(message)
    }

    /// Make sure the channel exists, creating it with the derived type and
    /// participant set when it does not.
    pub fn ensure_channel(
        &self,
        channel_id: Uuid,
        author_id: Uuid,
        message_server_id: Uuid,
        metadata: Option<&Value>,
    ) -> Result<Channel, ApiError> {
        if let Ok(channel) = self.store.get_channel(channel_id) {
            return Ok(channel);
        }

        if !self.store.server_exists(message_server_id)? {
            tracing::error!(%message_server_id, "channel auto-creation against unknown server");
            return Err(ApiError::new(
                ErrorCode::ChannelCreationFailed,
                "message server does not exist",
            ));
        }

        let id_prefix: String = channel_id.to_string().chars().take(8).collect();
        let target = dm_target(metadata).filter(|t| *t != author_id);

        let (channel_type, name, participants) = if dm_marked(metadata) || target.is_some() {
            if let Some(target) = target {
                (ChannelType::Dm, format!("DM {id_prefix}"), vec![author_id, target])
            } else {
                tracing::warn!(
                    %channel_id,
                    %author_id,
                    "DM metadata without a resolvable target, creating group instead"
                );
                (ChannelType::Group, format!("Chat {id_prefix}"), vec![author_id])
            }
        } else {
            (ChannelType::Group, format!("Chat {id_prefix}"), vec![author_id])
        };

        tracing::info!(
            %channel_id,
            channel_type = channel_type.as_str(),
            "auto-creating channel on first message"
        );

        let channel = self.store.create_channel(&NewChannel {
            id: Some(channel_id),
            message_server_id,
            name,
            channel_type,
            source_type: Some("auto_created".to_string()),
            topic: None,
            metadata: metadata.cloned(),
            participants,
        })?;
        Ok(channel)
    }

    /// Newest first, `limit` capped at [`MAX_MESSAGES_PER_PAGE`].
    pub fn get_messages(
        &self,
        channel_id: Uuid,
        limit: Option<usize>,
        before: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<Message>, ApiError> {
        let limit = limit.unwrap_or(DEFAULT_MESSAGES_PAGE).min(MAX_MESSAGES_PER_PAGE);
        Ok(self.store.list_messages(channel_id, limit, before)?)
    }

    pub async fn delete_message(&self, channel_id: Uuid, message_id: Uuid) -> Result<(), ApiError> {
        let message = self.store.get_message(message_id)?;
        if message.channel_id != channel_id {
            return Err(ApiError::new(
                ErrorCode::MessageNotFound,
                "message does not belong to this channel",
            ));
        }
        self.store.delete_message(message_id)?;

        self.bus
            .publish(
                Topic::MessageDeleted,
                json!({
                    "messageId": message_id.to_string(),
                    "channelId": channel_id.to_string(),
                }),
            )
            .await;

        self.hub.broadcast_to_room(
            channel_id,
            &Outbound::new(
                protocol::EVT_MESSAGE_DELETED,
                json!({
                    "messageId": message_id.to_string(),
                    "channelId": channel_id.to_string(),
                }),
            ),
            None,
        );
        Ok(())
    }

    /// Delete every message in the channel, in bounded batches.
    pub async fn clear_channel(&self, channel_id: Uuid) -> Result<usize, ApiError> {
        let _ = self.store.get_channel(channel_id)?;
        let mut total = 0;
        loop {
            let deleted = self
                .store
                .delete_channel_messages_batch(channel_id, CLEAR_BATCH_SIZE)?;
            total += deleted;
            if deleted < CLEAR_BATCH_SIZE {
                break;
            }
        }

        self.bus
            .publish(
                Topic::ChannelCleared,
                json!({ "channelId": channel_id.to_string() }),
            )
            .await;

        self.hub.broadcast_to_room(
            channel_id,
            &Outbound::new(
                protocol::EVT_CHANNEL_CLEARED,
                json!({ "channelId": channel_id.to_string(), "deleted": total }),
            ),
            None,
        );
        Ok(total)
    }

    pub fn update_channel(&self, channel_id: Uuid, patch: &ChannelPatch) -> Result<Channel, ApiError> {
        let channel = self.store.update_channel(channel_id, patch)?;
        self.hub.broadcast_to_room(
            channel_id,
            &Outbound::new(
                protocol::EVT_CHANNEL_UPDATED,
                serde_json::to_value(&channel).unwrap_or(Value::Null),
            ),
            None,
        );
        Ok(channel)
    }

    pub fn delete_channel(&self, channel_id: Uuid) -> Result<(), ApiError> {
        self.store.delete_channel(channel_id)?;
        self.hub.broadcast_to_room(
            channel_id,
            &Outbound::new(
                protocol::EVT_CHANNEL_DELETED,
                json!({ "channelId": channel_id.to_string() }),
            ),
            None,
        );
        Ok(())
    }

    // Thin persistence passthroughs.

    pub fn get_channel(&self, channel_id: Uuid) -> Result<Channel, ApiError> {
        Ok(self.store.get_channel(channel_id)?)
    }

    pub fn list_channels(&self, server_id: Uuid) -> Result<Vec<Channel>, ApiError> {
        Ok(self.store.list_channels(server_id)?)
    }

    pub fn list_participants(&self, channel_id: Uuid) -> Result<Vec<Uuid>, ApiError> {
        let _ = self.store.get_channel(channel_id)?;
        Ok(self.store.participants(channel_id)?)
    }

    pub fn add_participants(&self, channel_id: Uuid, user_ids: &[Uuid]) -> Result<(), ApiError> {
        Ok(self.store.add_participants(channel_id, user_ids)?)
    }

    pub fn remove_participant(&self, channel_id: Uuid, user_id: Uuid) -> Result<(), ApiError> {
        Ok(self.store.remove_participant(channel_id, user_id)?)
    }

    /// Generate a short channel title from the transcript. Requires at
    /// least four stored messages; the runtime is asked for a low
    /// temperature, short completion and enclosing quotes are trimmed.
    pub async fn generate_title(
        &self,
        channel_id: Uuid,
        agent_id: Uuid,
        registry: &RuntimeRegistry,
    ) -> Result<String, ApiError> {
        let _ = self.store.get_channel(channel_id)?;
        let count = self.store.count_messages(channel_id)?;
        if count < TITLE_MIN_MESSAGES {
            return Err(ApiError::new(
                ErrorCode::InvalidContent,
                format!("title generation requires at least {TITLE_MIN_MESSAGES} messages"),
            ));
        }

        let runtime = registry
            .get(agent_id)
            .await
            .ok_or_else(|| ApiError::new(ErrorCode::AgentNotFound, "agent is not running here"))?;

        let mut messages = self.store.list_messages(channel_id, 20, None)?;
        messages.reverse();
        let transcript = crate::title::build_transcript(&messages);

        let title = crate::title::generate_title(runtime.as_ref(), &transcript)
            .await
            .ok_or_else(|| ApiError::new(ErrorCode::RuntimeError, "title generation failed"))?;

        self.store.update_channel(
            channel_id,
            &ChannelPatch {
                name: Some(title.clone()),
                topic: None,
                metadata: None,
            },
        )?;
        Ok(title)
    }
}

/// `true` when metadata explicitly marks the channel as a DM. An explicit
/// DM marker beats a contradicting channel-type marker.
fn dm_marked(metadata: Option<&Value>) -> bool {
    let Some(meta) = metadata else { return false };
    if meta.get("isDm").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    meta.get("channelType")
        .and_then(Value::as_str)
        .is_some_and(|t| t.eq_ignore_ascii_case("DM"))
}

/// The second DM participant from `targetUserId` or `recipientId`.
fn dm_target(metadata: Option<&Value>) -> Option<Uuid> {
    let meta = metadata?;
    for key in ["targetUserId", "recipientId"] {
        if let Some(id) = meta
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::try_parse(s).ok())
        {
            return Some(id);
        }
    }
    None
}

fn as_object(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Snake-cased envelope published on `new_message`.
pub fn bus_envelope(message: &Message, server_id: Uuid, display_name: Option<&str>) -> Value {
    let mut envelope = json!({
        "id": message.id.to_string(),
        "channel_id": message.channel_id.to_string(),
        "message_server_id": server_id.to_string(),
        "author_id": message.author_id.to_string(),
        "content": message.content,
        "created_at": message.created_at.timestamp_millis(),
        "source_type": message.source_type,
        "raw_message": message.raw_message.clone().unwrap_or(Value::Null),
        "metadata": message.metadata.clone().unwrap_or(Value::Null),
    });
    if let Some(reply_to) = message.in_reply_to_root_message_id {
        envelope["in_reply_to_message_id"] = Value::String(reply_to.to_string());
    }
    if let Some(name) = display_name {
        envelope["author_display_name"] = Value::String(name.to_string());
    }
    envelope
}

/// Camel-cased payload for the socket `messageBroadcast` event.
pub fn broadcast_payload(message: &Message, server_id: Uuid, display_name: Option<&str>) -> Value {
    json!({
        "id": message.id.to_string(),
        "channelId": message.channel_id.to_string(),
        "roomId": message.channel_id.to_string(),
        "serverId": server_id.to_string(),
        "senderId": message.author_id.to_string(),
        "senderName": display_name.unwrap_or("User"),
        "text": message.content,
        "createdAt": message.created_at.timestamp_millis(),
        "source": message.source_type,
        "metadata": message.metadata.clone().unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MessageServer;
    use std::sync::Mutex;

    fn service() -> (Arc<MessageService>, MessageServer, Arc<MessageBus>, Arc<SocketHub>) {
        let store = Store::open_in_memory().unwrap();
        let server = store
            .create_server(None, "Test Server", "test", None, None)
            .unwrap();
        let bus = Arc::new(MessageBus::new());
        let hub = Arc::new(SocketHub::new());
        let service = Arc::new(MessageService::new(
            store,
            bus.clone(),
            hub.clone(),
            server.id,
        ));
        (service, server, bus, hub)
    }

    fn post(channel_id: Uuid, server_id: Uuid, metadata: Option<Value>) -> PostMessage {
        PostMessage {
            channel_id,
            author_id: Uuid::new_v4(),
            message_server_id: server_id,
            content: "hello".to_string(),
            in_reply_to_message_id: None,
            raw_message: None,
            metadata,
            source_type: Some("client_chat".to_string()),
            source_id: None,
            author_display_name: Some("Tester".to_string()),
        }
    }

    #[tokio::test]
    async fn rls_gate_rejects_foreign_server() {
        let (service, _server, _bus, _hub) = service();
        let err = service
            .post_message(post(Uuid::new_v4(), Uuid::new_v4(), None))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ForbiddenServerMismatch);
    }

    #[tokio::test]
    async fn auto_creates_group_channel_without_dm_metadata() {
        let (service, server, _bus, _hub) = service();
        let channel_id = Uuid::new_v4();
        let request = post(channel_id, server.id, None);
        let author = request.author_id;

        service.post_message(request).await.unwrap();

        let channel = service.get_channel(channel_id).unwrap();
        assert_eq!(channel.channel_type, ChannelType::Group);
        assert!(channel.name.starts_with("Chat "));
        assert_eq!(service.list_participants(channel_id).unwrap(), vec![author]);
    }

    #[tokio::test]
    async fn auto_creates_dm_with_target_participants() {
        let (service, server, _bus, _hub) = service();
        let channel_id = Uuid::new_v4();
        let target = Uuid::new_v4();
        let request = post(
            channel_id,
            server.id,
            Some(json!({"isDm": true, "targetUserId": target.to_string()})),
        );
        let author = request.author_id;

        service.post_message(request).await.unwrap();

        let channel = service.get_channel(channel_id).unwrap();
        assert_eq!(channel.channel_type, ChannelType::Dm);
        assert!(channel.name.starts_with("DM "));
        let mut participants = service.list_participants(channel_id).unwrap();
        participants.sort();
        let mut expected = vec![author, target];
        expected.sort();
        assert_eq!(participants, expected);
    }

    #[tokio::test]
    async fn dm_marker_beats_group_channel_type() {
        let (service, server, _bus, _hub) = service();
        let channel_id = Uuid::new_v4();
        let target = Uuid::new_v4();
        service
            .post_message(post(
                channel_id,
                server.id,
                Some(json!({
                    "isDm": true,
                    "channelType": "GROUP",
                    "targetUserId": target.to_string(),
                })),
            ))
            .await
            .unwrap();

        let channel = service.get_channel(channel_id).unwrap();
        assert_eq!(channel.channel_type, ChannelType::Dm);
    }

    #[tokio::test]
    async fn dm_metadata_without_target_degrades_to_group() {
        let (service, server, _bus, _hub) = service();
        let channel_id = Uuid::new_v4();
        service
            .post_message(post(channel_id, server.id, Some(json!({"isDm": true}))))
            .await
            .unwrap();

        let channel = service.get_channel(channel_id).unwrap();
        assert_eq!(channel.channel_type, ChannelType::Group);
        assert_eq!(service.list_participants(channel_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persist_happens_before_publish_before_broadcast() {
        let (service, server, bus, hub) = service();
        let channel_id = Uuid::new_v4();

        // A socket member of the room observes the broadcast; the bus
        // subscriber proves the message was readable at publish time.
        let (socket_id, mut socket_rx) = hub.register(Uuid::new_v4());
        hub.join_room(socket_id, channel_id);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let store = service.store().clone();
        bus.subscribe(Topic::NewMessage, move |payload| {
            let seen = seen_clone.clone();
            let store = store.clone();
            Box::pin(async move {
                let id = payload["id"].as_str().unwrap().parse::<Uuid>().unwrap();
                // The message must already be persisted when the bus fires.
                assert!(store.get_message(id).is_ok());
                seen.lock().unwrap().push("bus");
                Ok(())
            })
        })
        .await;

        service
            .post_message(post(channel_id, server.id, None))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["bus"]);
        let frame = socket_rx.try_recv().unwrap();
        assert_eq!(frame.event, "messageBroadcast");
        assert_eq!(frame.data["text"], "hello");
        assert_eq!(frame.data["senderName"], "Tester");
    }

    #[tokio::test]
    async fn bus_envelope_is_snake_cased() {
        let (service, server, bus, _hub) = service();
        let channel_id = Uuid::new_v4();

        let captured = Arc::new(Mutex::new(None));
        let captured_clone = captured.clone();
        bus.subscribe(Topic::NewMessage, move |payload| {
            let captured = captured_clone.clone();
            Box::pin(async move {
                *captured.lock().unwrap() = Some(payload);
                Ok(())
            })
        })
        .await;

        service
            .post_message(post(channel_id, server.id, None))
            .await
            .unwrap();

        let envelope = captured.lock().unwrap().clone().unwrap();
        assert!(envelope.get("channel_id").is_some());
        assert!(envelope.get("message_server_id").is_some());
        assert!(envelope.get("author_id").is_some());
        assert!(envelope["created_at"].is_i64());
        assert_eq!(envelope["metadata"]["user_display_name"], "Tester");
    }

    #[tokio::test]
    async fn get_messages_caps_limit() {
        let (service, server, _bus, _hub) = service();
        let channel_id = Uuid::new_v4();
        service
            .post_message(post(channel_id, server.id, None))
            .await
            .unwrap();

        // A huge limit must be accepted and capped, not rejected.
        let messages = service
            .get_messages(channel_id, Some(1_000_000), None)
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn delete_message_publishes_and_broadcasts() {
        let (service, server, bus, hub) = service();
        let channel_id = Uuid::new_v4();
        let message = service
            .post_message(post(channel_id, server.id, None))
            .await
            .unwrap();

        let (socket_id, mut rx) = hub.register(Uuid::new_v4());
        hub.join_room(socket_id, channel_id);

        let deleted = Arc::new(Mutex::new(Vec::new()));
        let deleted_clone = deleted.clone();
        bus.subscribe(Topic::MessageDeleted, move |payload| {
            let deleted = deleted_clone.clone();
            Box::pin(async move {
                deleted
                    .lock()
                    .unwrap()
                    .push(payload["messageId"].as_str().unwrap().to_string());
                Ok(())
            })
        })
        .await;

        service.delete_message(channel_id, message.id).await.unwrap();

        assert_eq!(*deleted.lock().unwrap(), vec![message.id.to_string()]);
        assert_eq!(rx.try_recv().unwrap().event, "messageDeleted");
    }

    #[tokio::test]
    async fn delete_message_from_wrong_channel_fails() {
        let (service, server, _bus, _hub) = service();
        let channel_id = Uuid::new_v4();
        let message = service
            .post_message(post(channel_id, server.id, None))
            .await
            .unwrap();

        let err = service
            .delete_message(Uuid::new_v4(), message.id)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MessageNotFound);
    }

    #[tokio::test]
    async fn clear_channel_drains_everything() {
        let (service, server, bus, _hub) = service();
        let channel_id = Uuid::new_v4();
        for _ in 0..3 {
            service
                .post_message(post(channel_id, server.id, None))
                .await
                .unwrap();
        }

        let cleared = Arc::new(Mutex::new(false));
        let cleared_clone = cleared.clone();
        bus.subscribe(Topic::ChannelCleared, move |_| {
            let cleared = cleared_clone.clone();
            Box::pin(async move {
                *cleared.lock().unwrap() = true;
                Ok(())
            })
        })
        .await;

        let total = service.clear_channel(channel_id).await.unwrap();
        assert_eq!(total, 3);
        assert!(*cleared.lock().unwrap());
        assert!(service.get_messages(channel_id, None, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn title_requires_four_messages() {
        let (service, server, _bus, _hub) = service();
        let registry = RuntimeRegistry::new();
        let agent_id = Uuid::new_v4();
        registry
            .register(Arc::new(crate::runtime::EchoRuntime::new(agent_id, "echo")))
            .await;

        let channel_id = Uuid::new_v4();
        service
            .post_message(post(channel_id, server.id, None))
            .await
            .unwrap();

        let err = service
            .generate_title(channel_id, agent_id, &registry)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidContent);

        for _ in 0..3 {
            service
                .post_message(post(channel_id, server.id, None))
                .await
                .unwrap();
        }
        let title = service
            .generate_title(channel_id, agent_id, &registry)
            .await
            .unwrap();
        assert!(!title.is_empty());
        assert_eq!(service.get_channel(channel_id).unwrap().name, title);
    }
}
