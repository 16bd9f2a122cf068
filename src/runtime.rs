//! Agent runtime contract.
//!
//! The runtime itself (LLM calls, memory, planning) is an external
//! collaborator. The core talks to it through [`AgentRuntime`], and agent
//! replies flow back over a typed channel with a single producer (the
//! runtime) and one consumer (SSE writer, sync collector, or connector).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::db::ChannelType;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("agent call timed out")]
    Timeout,
    #[error("runtime failure: {0}")]
    Failed(String),
}

/// The message handed to an agent runtime.
#[derive(Debug, Clone)]
pub struct AgentInput {
    /// Author of the triggering message.
    pub entity_id: Uuid,
    /// Channel the message arrived on.
    pub room_id: Uuid,
    /// Message server the channel belongs to.
    pub world_id: Option<Uuid>,
    pub content: String,
    pub source: Option<String>,
    /// Central message id, when the input originates from the store.
    pub message_id: Option<Uuid>,
    pub display_name: Option<String>,
    pub metadata: Value,
}

/// A completed agent response.
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub text: String,
    pub actions: Vec<String>,
    pub metadata: Value,
}

impl AgentResponse {
    /// Responses the connector suppresses rather than posting.
    pub fn is_suppressed(&self) -> bool {
        self.actions.iter().any(|a| a == "IGNORE") || self.text.trim().is_empty()
    }
}

/// Events the runtime produces while handling one message.
#[derive(Debug, Clone)]
pub enum AgentReply {
    Chunk {
        text: String,
        message_id: Option<Uuid>,
    },
    Complete {
        response: AgentResponse,
    },
    Error {
        message: String,
    },
}

/// Contract the core requires from every agent worker.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn agent_id(&self) -> Uuid;
    fn agent_name(&self) -> &str;

    /// Handle one inbound message. Streaming chunks, the final response,
    /// and errors are all delivered through `replies`; the call returns
    /// once the runtime is done producing.
    async fn handle_message(
        &self,
        input: AgentInput,
        replies: mpsc::Sender<AgentReply>,
    ) -> Result<(), RuntimeError>;

    /// One-shot text generation (title generation and similar).
    async fn generate_text(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, RuntimeError>;

    /// Ensure the agent-local world, room, and author entity exist.
    async fn ensure_connection(
        &self,
        entity_id: Uuid,
        room_id: Uuid,
        world_id: Uuid,
        channel_type: ChannelType,
        display_name: Option<&str>,
    ) -> Result<(), RuntimeError>;

    /// True when a memory with this id was already recorded (idempotence).
    async fn has_memory(&self, memory_id: Uuid) -> Result<bool, RuntimeError>;

    /// Record the inbound message as an agent-local memory.
    async fn record_memory(&self, memory_id: Uuid, input: &AgentInput) -> Result<(), RuntimeError>;

    /// Drop the memory derived from a deleted central message.
    async fn delete_memory(&self, memory_id: Uuid) -> Result<(), RuntimeError>;

    /// Drop all memories for a cleared room.
    async fn clear_room(&self, room_id: Uuid) -> Result<(), RuntimeError>;
}

/// Registry of live agent runtimes, keyed by agent id.
#[derive(Default)]
pub struct RuntimeRegistry {
    runtimes: RwLock<HashMap<Uuid, Arc<dyn AgentRuntime>>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, runtime: Arc<dyn AgentRuntime>) {
        self.runtimes
            .write()
            .await
            .insert(runtime.agent_id(), runtime);
    }

    pub async fn remove(&self, agent_id: Uuid) {
        self.runtimes.write().await.remove(&agent_id);
    }

    pub async fn get(&self, agent_id: Uuid) -> Option<Arc<dyn AgentRuntime>> {
        self.runtimes.read().await.get(&agent_id).cloned()
    }

    pub async fn contains(&self, agent_id: Uuid) -> bool {
        self.runtimes.read().await.contains_key(&agent_id)
    }

    /// Any runtime, used when an operation only needs "the first available
    /// agent" (socket entity-join notifications).
    pub async fn first(&self) -> Option<Arc<dyn AgentRuntime>> {
        self.runtimes.read().await.values().next().cloned()
    }
}

/// Deterministic runtime used by the default binary wiring and by tests.
///
/// Streams the reply in two chunks, then completes with an echo of the
/// inbound content. Memories live in an in-process set, which is all the
/// idempotence gate needs.
pub struct EchoRuntime {
    agent_id: Uuid,
    name: String,
    memories: Mutex<HashSet<Uuid>>,
}

impl EchoRuntime {
    pub fn new(agent_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            agent_id,
            name: name.into(),
            memories: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl AgentRuntime for EchoRuntime {
    fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    fn agent_name(&self) -> &str {
        &self.name
    }

    async fn handle_message(
        &self,
        input: AgentInput,
        replies: mpsc::Sender<AgentReply>,
    ) -> Result<(), RuntimeError> {
        let text = format!("You said: {}", input.content);
        let midpoint = text.chars().count() / 2;
        let first: String = text.chars().take(midpoint).collect();
        let rest: String = text.chars().skip(midpoint).collect();

        for chunk in [first, rest] {
            if !chunk.is_empty()
                && replies
                    .send(AgentReply::Chunk {
                        text: chunk,
                        message_id: input.message_id,
                    })
                    .await
                    .is_err()
            {
                // Consumer went away; stop producing.
                return Ok(());
            }
        }

        let _ = replies
            .send(AgentReply::Complete {
                response: AgentResponse {
                    text,
                    actions: vec!["REPLY".to_string()],
                    metadata: Value::Null,
                },
            })
            .await;
        Ok(())
    }

    async fn generate_text(
        &self,
        prompt: &str,
        _temperature: f32,
        max_tokens: u32,
    ) -> Result<String, RuntimeError> {
        let words: Vec<&str> = prompt.split_whitespace().rev().take(4).collect();
        let mut title = words.join(" ");
        if title.is_empty() {
            title = "Conversation".to_string();
        }
        let cap = max_tokens as usize * 4;
        if title.chars().count() > cap {
            title = title.chars().take(cap).collect();
        }
        Ok(title)
    }

    async fn ensure_connection(
        &self,
        _entity_id: Uuid,
        _room_id: Uuid,
        _world_id: Uuid,
        _channel_type: ChannelType,
        _display_name: Option<&str>,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn has_memory(&self, memory_id: Uuid) -> Result<bool, RuntimeError> {
        Ok(self.memories.lock().await.contains(&memory_id))
    }

    async fn record_memory(&self, memory_id: Uuid, _input: &AgentInput) -> Result<(), RuntimeError> {
        self.memories.lock().await.insert(memory_id);
        Ok(())
    }

    async fn delete_memory(&self, memory_id: Uuid) -> Result<(), RuntimeError> {
        self.memories.lock().await.remove(&memory_id);
        Ok(())
    }

    async fn clear_room(&self, _room_id: Uuid) -> Result<(), RuntimeError> {
        Ok(())
    }
}
