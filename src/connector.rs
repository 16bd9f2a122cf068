//! Per-agent connector: translates bus events into runtime calls and posts
//! the results back to the central message service.
//!
//! One connector runs per registered agent worker. It keeps a cache of the
//! servers the agent belongs to and gates every inbound message before the
//! runtime ever sees it.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::bus::{MessageBus, SubscriptionId, Topic};
use crate::central::{ReplySink, ReplySubmission};
use crate::db::Store;
use crate::runtime::{AgentInput, AgentReply, AgentRuntime};

/// Stable namespace for deriving per-agent memory ids.
const MEMORY_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5f, 0x1b, 0x6d, 0x1e, 0x8c, 0x2a, 0x4e, 0x1f, 0x9d, 0x3b, 0x7c, 0x5e, 0x2f, 0x8a, 0x6b,
    0x4d,
]);

/// Memory id derived from `(central_message_id, agent_id)`. Deterministic,
/// so redelivery of the same bus event is idempotent.
pub fn memory_id(central_message_id: Uuid, agent_id: Uuid) -> Uuid {
    let name = format!("{central_message_id}:{agent_id}");
    Uuid::new_v5(&MEMORY_NAMESPACE, name.as_bytes())
}

/// A parsed `new_message` bus envelope. Anything that fails to parse here
/// is dropped before any gating runs.
#[derive(Debug, Clone)]
struct InboundEnvelope {
    id: Uuid,
    channel_id: Uuid,
    message_server_id: Uuid,
    author_id: Uuid,
    content: String,
    source_type: Option<String>,
    metadata: Value,
    author_display_name: Option<String>,
}

impl InboundEnvelope {
    fn parse(payload: &Value) -> Option<Self> {
        let id = parse_uuid_field(payload, "id")?;
        let channel_id = parse_uuid_field(payload, "channel_id")?;
        let message_server_id = parse_uuid_field(payload, "message_server_id")?;
        let author_id = parse_uuid_field(payload, "author_id")?;
        let content = payload.get("content")?.as_str()?.to_string();
        Some(Self {
            id,
            channel_id,
            message_server_id,
            author_id,
            content,
            source_type: payload
                .get("source_type")
                .and_then(Value::as_str)
                .map(str::to_string),
            metadata: payload.get("metadata").cloned().unwrap_or(Value::Null),
            author_display_name: payload
                .get("author_display_name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    payload
                        .get("metadata")
                        .and_then(|m| m.get("user_display_name"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                }),
        })
    }
}

fn parse_uuid_field(payload: &Value, field: &str) -> Option<Uuid> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::try_parse(s).ok())
}

pub struct AgentConnector {
    runtime: Arc<dyn AgentRuntime>,
    store: Store,
    bus: Arc<MessageBus>,
    sink: Arc<dyn ReplySink>,
    servers: RwLock<HashSet<Uuid>>,
    channels: RwLock<HashSet<Uuid>>,
    subscriptions: Mutex<Vec<(Topic, SubscriptionId)>>,
}

impl AgentConnector {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        store: Store,
        bus: Arc<MessageBus>,
        sink: Arc<dyn ReplySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            store,
            bus,
            sink,
            servers: RwLock::new(HashSet::new()),
            channels: RwLock::new(HashSet::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    fn agent_id(&self) -> Uuid {
        self.runtime.agent_id()
    }

    /// Load the server/channel caches and attach to the bus.
    pub async fn start(self: &Arc<Self>) {
        self.refresh_caches().await;

        let mut ids = Vec::new();

        let connector = Arc::clone(self);
        ids.push((
            Topic::NewMessage,
            self.bus
                .subscribe(Topic::NewMessage, move |payload| {
                    let connector = Arc::clone(&connector);
                    Box::pin(async move {
                        connector.on_new_message(&payload).await;
                        Ok(())
                    })
                })
                .await,
        ));

        let connector = Arc::clone(self);
        ids.push((
            Topic::ServerAgentUpdate,
            self.bus
                .subscribe(Topic::ServerAgentUpdate, move |payload| {
                    let connector = Arc::clone(&connector);
                    Box::pin(async move {
                        connector.on_server_agent_update(&payload).await;
                        Ok(())
                    })
                })
                .await,
        ));

        let connector = Arc::clone(self);
        ids.push((
            Topic::MessageDeleted,
            self.bus
                .subscribe(Topic::MessageDeleted, move |payload| {
                    let connector = Arc::clone(&connector);
                    Box::pin(async move {
                        connector.on_message_deleted(&payload).await;
                        Ok(())
                    })
                })
                .await,
        ));

        let connector = Arc::clone(self);
        ids.push((
            Topic::ChannelCleared,
            self.bus
                .subscribe(Topic::ChannelCleared, move |payload| {
                    let connector = Arc::clone(&connector);
                    Box::pin(async move {
                        connector.on_channel_cleared(&payload).await;
                        Ok(())
                    })
                })
                .await,
        ));

        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            *subscriptions = ids;
        }

        tracing::info!(
            agent_id = %self.agent_id(),
            agent_name = self.runtime.agent_name(),
            servers = self.servers.read().await.len(),
            "agent connector started"
        );
    }

    /// Detach from the bus.
    pub async fn cleanup(&self) {
        let ids: Vec<(Topic, SubscriptionId)> = {
            match self.subscriptions.lock() {
                Ok(mut guard) => guard.drain(..).collect(),
                Err(poisoned) => poisoned.into_inner().drain(..).collect(),
            }
        };
        for (topic, id) in ids {
            self.bus.unsubscribe(topic, id).await;
        }
    }

    async fn refresh_caches(&self) {
        let agent_id = self.agent_id();
        let server_ids = self
            .store
            .list_servers_for_agent(agent_id)
            .unwrap_or_default();

        let mut channel_ids = HashSet::new();
        for server_id in &server_ids {
            if let Ok(channels) = self.store.list_channels(*server_id) {
                channel_ids.extend(channels.into_iter().map(|c| c.id));
            }
        }

        *self.servers.write().await = server_ids.into_iter().collect();
        *self.channels.write().await = channel_ids;
    }

    /// The seven-step ingestion pipeline for one central message.
    async fn on_new_message(self: &Arc<Self>, payload: &Value) {
        let agent_id = self.agent_id();

        // 1. Type-check required fields; drop malformed envelopes.
        let Some(envelope) = InboundEnvelope::parse(payload) else {
            tracing::warn!(agent_id = %agent_id, "malformed new_message envelope, dropping");
            return;
        };

        // 2. Only servers this agent belongs to.
        if !self.servers.read().await.contains(&envelope.message_server_id) {
            return;
        }

        // 3. Never react to our own messages.
        if envelope.author_id == agent_id {
            return;
        }

        // 4. Channel participation gate.
        match self.store.participants(envelope.channel_id) {
            Ok(participants) if participants.contains(&agent_id) => {}
            Ok(_) => {
                tracing::debug!(
                    agent_id = %agent_id,
                    channel_id = %envelope.channel_id,
                    "agent not a participant, dropping message"
                );
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "participant lookup failed, dropping message");
                return;
            }
        }

        // 5. Ensure the agent-local world, room, and author entity exist.
        let channel_type = self
            .store
            .get_channel(envelope.channel_id)
            .map(|c| c.channel_type)
            .unwrap_or(crate::db::ChannelType::Group);
        if let Err(err) = self
            .runtime
            .ensure_connection(
                envelope.author_id,
                envelope.channel_id,
                envelope.message_server_id,
                channel_type,
                envelope.author_display_name.as_deref(),
            )
            .await
        {
            tracing::error!(error = %err, "ensure_connection failed, dropping message");
            return;
        }

        // 6. Idempotence by stable memory id.
        let memory_id = memory_id(envelope.id, agent_id);
        match self.runtime.has_memory(memory_id).await {
            Ok(true) => {
                tracing::debug!(
                    agent_id = %agent_id,
                    memory_id = %memory_id,
                    "duplicate central message, dropping"
                );
                return;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::error!(error = %err, "memory lookup failed, dropping message");
                return;
            }
        }

        let input = AgentInput {
            entity_id: envelope.author_id,
            room_id: envelope.channel_id,
            world_id: Some(envelope.message_server_id),
            content: envelope.content.clone(),
            source: envelope.source_type.clone(),
            message_id: Some(envelope.id),
            display_name: envelope.author_display_name.clone(),
            metadata: envelope.metadata.clone(),
        };

        if let Err(err) = self.runtime.record_memory(memory_id, &input).await {
            tracing::error!(error = %err, "failed to record memory, dropping message");
            return;
        }

        self.channels.write().await.insert(envelope.channel_id);

        // 7. Invoke the runtime off the bus delivery path.
        let connector = Arc::clone(self);
        tokio::spawn(async move {
            connector.run_agent(envelope, input).await;
        });
    }

    /// Drive one runtime invocation: relay chunks to the bus, submit the
    /// final reply, surface errors.
    async fn run_agent(&self, envelope: InboundEnvelope, input: AgentInput) {
        let agent_id = self.agent_id();
        let response_id = Uuid::new_v4();

        let (reply_tx, mut reply_rx) = mpsc::channel::<AgentReply>(64);
        let runtime = Arc::clone(&self.runtime);
        let worker =
            tokio::spawn(async move { runtime.handle_message(input, reply_tx).await });

        let mut index: u64 = 0;
        let mut partial_text = String::new();
        while let Some(reply) = reply_rx.recv().await {
            match reply {
                AgentReply::Chunk { text, .. } => {
                    partial_text.push_str(&text);
                    self.bus
                        .publish(
                            Topic::MessageStreamChunk,
                            json!({
                                "channelId": envelope.channel_id.to_string(),
                                "messageId": response_id.to_string(),
                                "chunk": text,
                                "index": index,
                                "agentId": agent_id.to_string(),
                            }),
                        )
                        .await;
                    index += 1;
                }
                AgentReply::Complete { response } => {
                    if response.is_suppressed() {
                        tracing::debug!(
                            agent_id = %agent_id,
                            channel_id = %envelope.channel_id,
                            "agent response suppressed"
                        );
                        continue;
                    }
                    let submission = ReplySubmission {
                        channel_id: envelope.channel_id,
                        author_id: agent_id,
                        server_id: envelope.message_server_id,
                        content: response.text,
                        in_reply_to_message_id: Some(envelope.id),
                        metadata: Some(json!({
                            "agentName": self.runtime.agent_name(),
                            "actions": response.actions,
                        })),
                    };
                    if let Err(err) = self.sink.submit_reply(submission).await {
                        tracing::error!(
                            agent_id = %agent_id,
                            error = %err,
                            "failed to submit agent reply"
                        );
                    }
                }
                AgentReply::Error { message } => {
                    tracing::error!(agent_id = %agent_id, error = %message, "agent reported error");
                    self.publish_stream_error(&envelope, response_id, &message, &partial_text)
                        .await;
                }
            }
        }

        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.publish_stream_error(&envelope, response_id, &err.to_string(), &partial_text)
                    .await;
            }
            Err(join_err) => {
                if !join_err.is_cancelled() {
                    self.publish_stream_error(&envelope, response_id, "agent task failed", &partial_text)
                        .await;
                }
            }
        }
    }

    async fn publish_stream_error(
        &self,
        envelope: &InboundEnvelope,
        response_id: Uuid,
        message: &str,
        partial_text: &str,
    ) {
        let mut payload = json!({
            "channelId": envelope.channel_id.to_string(),
            "messageId": response_id.to_string(),
            "agentId": self.agent_id().to_string(),
            "error": message,
        });
        if !partial_text.is_empty() {
            payload["partialText"] = Value::String(partial_text.to_string());
        }
        self.bus.publish(Topic::MessageStreamError, payload).await;
    }

    async fn on_server_agent_update(&self, payload: &Value) {
        let Some(update_agent) = parse_uuid_field(payload, "agentId") else {
            return;
        };
        if update_agent != self.agent_id() {
            return;
        }
        let Some(server_id) = parse_uuid_field(payload, "messageServerId") else {
            return;
        };
        let update_type = payload.get("type").and_then(Value::as_str).unwrap_or("");

        match update_type {
            "agent_added_to_server" => {
                self.servers.write().await.insert(server_id);
            }
            "agent_removed_from_server" => {
                self.servers.write().await.remove(&server_id);
            }
            other => {
                tracing::warn!(update_type = other, "unknown server_agent_update type");
                return;
            }
        }
        self.refresh_caches().await;
        tracing::info!(
            agent_id = %self.agent_id(),
            server_id = %server_id,
            update_type,
            "agent server subscription updated"
        );
    }

    async fn on_message_deleted(&self, payload: &Value) {
        let Some(message_id) = parse_uuid_field(payload, "messageId") else {
            return;
        };
        let memory = memory_id(message_id, self.agent_id());
        if let Err(err) = self.runtime.delete_memory(memory).await {
            tracing::error!(error = %err, "failed to delete agent memory");
        }
    }

    async fn on_channel_cleared(&self, payload: &Value) {
        let Some(channel_id) = parse_uuid_field(payload, "channelId") else {
            return;
        };
        if let Err(err) = self.runtime.clear_room(channel_id).await {
            tracing::error!(error = %err, "failed to clear agent room");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ChannelType, NewChannel};
    use crate::runtime::{AgentResponse, EchoRuntime, RuntimeError};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    struct RecordingSink {
        tx: UnboundedSender<ReplySubmission>,
    }

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn submit_reply(&self, reply: ReplySubmission) -> Result<(), String> {
            self.tx.send(reply).map_err(|e| e.to_string())
        }
    }

    struct Fixture {
        connector: Arc<AgentConnector>,
        bus: Arc<MessageBus>,
        store: Store,
        agent_id: Uuid,
        server_id: Uuid,
        channel_id: Uuid,
        replies: UnboundedReceiver<ReplySubmission>,
    }

    async fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let server = store
            .create_server(None, "Test Server", "test", None, None)
            .unwrap();
        let agent_id = Uuid::new_v4();
        store.add_agent_to_server(server.id, agent_id).unwrap();

        let channel = store
            .create_channel(&NewChannel {
                id: None,
                message_server_id: server.id,
                name: "general".to_string(),
                channel_type: ChannelType::Group,
                source_type: None,
                topic: None,
                metadata: None,
                participants: vec![agent_id, Uuid::new_v4()],
            })
            .unwrap();

        let bus = Arc::new(MessageBus::new());
        let (tx, replies) = unbounded_channel();
        let runtime = Arc::new(EchoRuntime::new(agent_id, "echo"));
        let connector = AgentConnector::new(
            runtime,
            store.clone(),
            bus.clone(),
            Arc::new(RecordingSink { tx }),
        );
        connector.start().await;

        Fixture {
            connector,
            bus,
            store,
            agent_id,
            server_id: server.id,
            channel_id: channel.id,
            replies,
        }
    }

    fn envelope(fx: &Fixture, author: Uuid, content: &str) -> Value {
        json!({
            "id": Uuid::new_v4().to_string(),
            "channel_id": fx.channel_id.to_string(),
            "message_server_id": fx.server_id.to_string(),
            "author_id": author.to_string(),
            "content": content,
            "created_at": 0,
            "source_type": "client_chat",
            "raw_message": {},
            "metadata": {"user_display_name": "Tester"},
        })
    }

    async fn recv_reply(fx: &mut Fixture) -> Option<ReplySubmission> {
        tokio::time::timeout(Duration::from_secs(2), fx.replies.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn happy_path_submits_reply() {
        let mut fx = fixture().await;
        let author = Uuid::new_v4();
        fx.bus
            .publish(Topic::NewMessage, envelope(&fx, author, "hi agent"))
            .await;

        let reply = recv_reply(&mut fx).await.expect("reply expected");
        assert_eq!(reply.content, "You said: hi agent");
        assert_eq!(reply.author_id, fx.agent_id);
        assert_eq!(reply.channel_id, fx.channel_id);
        assert!(reply.in_reply_to_message_id.is_some());
    }

    #[tokio::test]
    async fn drops_own_messages() {
        let mut fx = fixture().await;
        let own = envelope(&fx, fx.agent_id, "talking to myself");
        fx.bus.publish(Topic::NewMessage, own).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.replies.try_recv().is_err());
        let _ = &fx.connector;
    }

    #[tokio::test]
    async fn drops_unknown_server() {
        let mut fx = fixture().await;
        let mut env = envelope(&fx, Uuid::new_v4(), "hello");
        env["message_server_id"] = Value::String(Uuid::new_v4().to_string());
        fx.bus.publish(Topic::NewMessage, env).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn drops_when_not_participant() {
        let mut fx = fixture().await;
        let outsider_channel = fx
            .store
            .create_channel(&NewChannel {
                id: None,
                message_server_id: fx.server_id,
                name: "private".to_string(),
                channel_type: ChannelType::Group,
                source_type: None,
                topic: None,
                metadata: None,
                participants: vec![Uuid::new_v4()],
            })
            .unwrap();

        let mut env = envelope(&fx, Uuid::new_v4(), "psst");
        env["channel_id"] = Value::String(outsider_channel.id.to_string());
        fx.bus.publish(Topic::NewMessage, env).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn drops_malformed_envelopes() {
        let mut fx = fixture().await;
        fx.bus
            .publish(Topic::NewMessage, json!({"id": "not-a-uuid"}))
            .await;
        fx.bus.publish(Topic::NewMessage, json!({})).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_delivery_yields_one_reply() {
        let mut fx = fixture().await;
        let env = envelope(&fx, Uuid::new_v4(), "once please");

        fx.bus.publish(Topic::NewMessage, env.clone()).await;
        fx.bus.publish(Topic::NewMessage, env).await;

        assert!(recv_reply(&mut fx).await.is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_chunks_carry_contiguous_indices() {
        let mut fx = fixture().await;

        let chunks = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chunks_clone = chunks.clone();
        fx.bus
            .subscribe(Topic::MessageStreamChunk, move |payload| {
                let chunks = chunks_clone.clone();
                Box::pin(async move {
                    chunks
                        .lock()
                        .unwrap()
                        .push(payload["index"].as_u64().unwrap());
                    Ok(())
                })
            })
            .await;

        fx.bus
            .publish(Topic::NewMessage, envelope(&fx, Uuid::new_v4(), "stream"))
            .await;
        assert!(recv_reply(&mut fx).await.is_some());

        let indices = chunks.lock().unwrap().clone();
        let expected: Vec<u64> = (0..indices.len() as u64).collect();
        assert_eq!(indices, expected);
        assert!(!indices.is_empty());
    }

    #[tokio::test]
    async fn server_agent_update_gates_future_messages() {
        let mut fx = fixture().await;

        fx.bus
            .publish(
                Topic::ServerAgentUpdate,
                json!({
                    "type": "agent_removed_from_server",
                    "messageServerId": fx.server_id.to_string(),
                    "agentId": fx.agent_id.to_string(),
                }),
            )
            .await;

        fx.bus
            .publish(Topic::NewMessage, envelope(&fx, Uuid::new_v4(), "anyone?"))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.replies.try_recv().is_err());

        fx.bus
            .publish(
                Topic::ServerAgentUpdate,
                json!({
                    "type": "agent_added_to_server",
                    "messageServerId": fx.server_id.to_string(),
                    "agentId": fx.agent_id.to_string(),
                }),
            )
            .await;

        fx.bus
            .publish(Topic::NewMessage, envelope(&fx, Uuid::new_v4(), "back"))
            .await;
        assert!(recv_reply(&mut fx).await.is_some());
    }

    #[tokio::test]
    async fn suppressed_responses_are_not_posted() {
        struct IgnoringRuntime {
            inner: EchoRuntime,
        }

        #[async_trait]
        impl AgentRuntime for IgnoringRuntime {
            fn agent_id(&self) -> Uuid {
                self.inner.agent_id()
            }
            fn agent_name(&self) -> &str {
                self.inner.agent_name()
            }
            async fn handle_message(
                &self,
                _input: AgentInput,
                replies: mpsc::Sender<AgentReply>,
            ) -> Result<(), RuntimeError> {
                let _ = replies
                    .send(AgentReply::Complete {
                        response: AgentResponse {
                            text: "should not appear".to_string(),
                            actions: vec!["IGNORE".to_string()],
                            metadata: Value::Null,
                        },
                    })
                    .await;
                Ok(())
            }
            async fn generate_text(
                &self,
                prompt: &str,
                temperature: f32,
                max_tokens: u32,
            ) -> Result<String, RuntimeError> {
                self.inner.generate_text(prompt, temperature, max_tokens).await
            }
            async fn ensure_connection(
                &self,
                entity_id: Uuid,
                room_id: Uuid,
                world_id: Uuid,
                channel_type: ChannelType,
                display_name: Option<&str>,
            ) -> Result<(), RuntimeError> {
                self.inner
                    .ensure_connection(entity_id, room_id, world_id, channel_type, display_name)
                    .await
            }
            async fn has_memory(&self, memory_id: Uuid) -> Result<bool, RuntimeError> {
                self.inner.has_memory(memory_id).await
            }
            async fn record_memory(
                &self,
                memory_id: Uuid,
                input: &AgentInput,
            ) -> Result<(), RuntimeError> {
                self.inner.record_memory(memory_id, input).await
            }
            async fn delete_memory(&self, memory_id: Uuid) -> Result<(), RuntimeError> {
                self.inner.delete_memory(memory_id).await
            }
            async fn clear_room(&self, room_id: Uuid) -> Result<(), RuntimeError> {
                self.inner.clear_room(room_id).await
            }
        }

        let store = Store::open_in_memory().unwrap();
        let server = store
            .create_server(None, "S", "test", None, None)
            .unwrap();
        let agent_id = Uuid::new_v4();
        store.add_agent_to_server(server.id, agent_id).unwrap();
        let channel = store
            .create_channel(&NewChannel {
                id: None,
                message_server_id: server.id,
                name: "quiet".to_string(),
                channel_type: ChannelType::Group,
                source_type: None,
                topic: None,
                metadata: None,
                participants: vec![agent_id],
            })
            .unwrap();

        let bus = Arc::new(MessageBus::new());
        let (tx, mut replies) = unbounded_channel();
        let connector = AgentConnector::new(
            Arc::new(IgnoringRuntime {
                inner: EchoRuntime::new(agent_id, "quiet"),
            }),
            store,
            bus.clone(),
            Arc::new(RecordingSink { tx }),
        );
        connector.start().await;

        bus.publish(
            Topic::NewMessage,
            json!({
                "id": Uuid::new_v4().to_string(),
                "channel_id": channel.id.to_string(),
                "message_server_id": server.id.to_string(),
                "author_id": Uuid::new_v4().to_string(),
                "content": "are you there?",
            }),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn message_deleted_removes_memory() {
        let mut fx = fixture().await;
        let env = envelope(&fx, Uuid::new_v4(), "remember me");
        let message_id = Uuid::try_parse(env["id"].as_str().unwrap()).unwrap();

        fx.bus.publish(Topic::NewMessage, env).await;
        assert!(recv_reply(&mut fx).await.is_some());

        let memory = memory_id(message_id, fx.agent_id);
        assert!(fx.connector.runtime.has_memory(memory).await.unwrap());

        fx.bus
            .publish(
                Topic::MessageDeleted,
                json!({
                    "messageId": message_id.to_string(),
                    "channelId": fx.channel_id.to_string(),
                }),
            )
            .await;

        assert!(!fx.connector.runtime.has_memory(memory).await.unwrap());
    }

    #[test]
    fn memory_id_is_stable_and_distinct() {
        let message = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(memory_id(message, a), memory_id(message, a));
        assert_ne!(memory_id(message, a), memory_id(message, b));
        assert_ne!(memory_id(message, a), memory_id(Uuid::new_v4(), a));
    }

    #[tokio::test]
    async fn cleanup_detaches_from_bus() {
        let mut fx = fixture().await;
        fx.connector.cleanup().await;

        fx.bus
            .publish(Topic::NewMessage, envelope(&fx, Uuid::new_v4(), "gone"))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.replies.try_recv().is_err());
    }
}
