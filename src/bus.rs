//! In-process publish/subscribe bus linking HTTP ingress, socket ingress,
//! and agent workers.
//!
//! Delivery is cooperative on the publisher's task: subscribers for a topic
//! run one after another in registration order. There is no persistence and
//! no ordering guarantee across topics. A failing subscriber is logged and
//! skipped; it never affects its siblings.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Bus topics. Wire names are snake_case, matching the bus envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    NewMessage,
    MessageStreamChunk,
    MessageStreamError,
    ServerAgentUpdate,
    MessageDeleted,
    ChannelCleared,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::MessageStreamChunk => "message_stream_chunk",
            Self::MessageStreamError => "message_stream_error",
            Self::ServerAgentUpdate => "server_agent_update",
            Self::MessageDeleted => "message_deleted",
            Self::ChannelCleared => "channel_cleared",
        }
    }
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Token returned by [`MessageBus::subscribe`]; pass it back to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct MessageBus {
    topics: RwLock<HashMap<Topic, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for a topic. Subscribers run in registration
    /// order on every publish.
    pub async fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(Value) -> BoxFuture<'static, Result<(), String>> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topics
            .write()
            .await
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub async fn unsubscribe(&self, topic: Topic, id: SubscriptionId) {
        if let Some(handlers) = self.topics.write().await.get_mut(&topic) {
            handlers.retain(|(hid, _)| *hid != id);
        }
    }

    /// Deliver `payload` to every current subscriber of `topic`, in order.
    /// Subscriber failures are logged and swallowed.
    pub async fn publish(&self, topic: Topic, payload: Value) {
        let handlers: Vec<Handler> = {
            let topics = self.topics.read().await;
            topics
                .get(&topic)
                .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };

        tracing::trace!(topic = topic.as_str(), subscribers = handlers.len(), "bus publish");

        for handler in handlers {
            if let Err(err) = handler(payload.clone()).await {
                tracing::error!(topic = topic.as_str(), error = %err, "bus subscriber failed");
            }
        }
    }

    pub async fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics
            .read()
            .await
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Drop every subscriber. Used by shutdown cleanup.
    pub async fn clear(&self) {
        self.topics.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recording_handler(
        log: Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    ) -> impl Fn(Value) -> BoxFuture<'static, Result<(), String>> + Send + Sync + 'static {
        move |_payload| -> BoxFuture<'static, Result<(), String>> {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(tag.to_string());
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn delivers_in_registration_order() {
        let bus = MessageBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::NewMessage, recording_handler(log.clone(), "first"))
            .await;
        bus.subscribe(Topic::NewMessage, recording_handler(log.clone(), "second"))
            .await;

        bus.publish(Topic::NewMessage, json!({"id": "x"})).await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_break_siblings() {
        let bus = MessageBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::NewMessage, |_| {
            Box::pin(async { Err("boom".to_string()) })
        })
        .await;
        bus.subscribe(Topic::NewMessage, recording_handler(log.clone(), "survivor"))
            .await;

        bus.publish(Topic::NewMessage, json!({})).await;

        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[tokio::test]
    async fn unsubscribe_detaches() {
        let bus = MessageBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus
            .subscribe(Topic::MessageDeleted, recording_handler(log.clone(), "gone"))
            .await;
        bus.unsubscribe(Topic::MessageDeleted, id).await;

        bus.publish(Topic::MessageDeleted, json!({})).await;

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.subscriber_count(Topic::MessageDeleted).await, 0);
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = MessageBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::ChannelCleared, recording_handler(log.clone(), "cleared"))
            .await;

        bus.publish(Topic::NewMessage, json!({})).await;
        assert!(log.lock().unwrap().is_empty());

        bus.publish(Topic::ChannelCleared, json!({})).await;
        assert_eq!(*log.lock().unwrap(), vec!["cleared"]);
    }
}
