//! Socket hub: per-socket senders, channel rooms, entity indexing, log
//! stream subscriptions, and the bus→socket stream relay.
//!
//! The HTTP upgrade handler (`api::ws`) owns the read loop; everything a
//! handler or service needs to emit toward connected sockets goes through
//! this hub.

mod logs;
pub mod protocol;

pub use logs::{LogEntry, SocketLogLayer};

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::{MessageBus, SubscriptionId, Topic};
use protocol::{EVT_LOG_STREAM, EVT_STREAM_CHUNK, EVT_STREAM_ERROR};

/// One server→client frame.
#[derive(Debug, Clone, Serialize)]
pub struct Outbound {
    pub event: String,
    pub data: Value,
}

impl Outbound {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }
}

/// Per-socket log stream filter. `level` is the numeric floor; agent name
/// matches exactly when set.
#[derive(Debug, Clone)]
pub struct LogFilter {
    pub agent_name: Option<String>,
    pub level: u8,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            agent_name: None,
            level: logs::LEVEL_INFO,
        }
    }
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if entry.level < self.level {
            return false;
        }
        match (&self.agent_name, &entry.agent_name) {
            (Some(wanted), Some(actual)) => wanted == actual,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

struct SocketEntry {
    entity_id: Uuid,
    sender: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct HubState {
    sockets: HashMap<Uuid, SocketEntry>,
    rooms: HashMap<Uuid, HashSet<Uuid>>,
    entity_sockets: HashMap<Uuid, HashSet<Uuid>>,
    socket_agent: HashMap<Uuid, Uuid>,
    log_subscriptions: HashMap<Uuid, LogFilter>,
}

#[derive(Default)]
pub struct SocketHub {
    state: Mutex<HubState>,
    bus_subscriptions: Mutex<Vec<(Topic, SubscriptionId)>>,
}

impl SocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, HubState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a connected socket. Returns its id and the frame receiver
    /// the connection's writer task drains.
    pub fn register(&self, entity_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<Outbound>) {
        let socket_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.locked();
        state.sockets.insert(
            socket_id,
            SocketEntry {
                entity_id,
                sender: tx,
            },
        );
        state
            .entity_sockets
            .entry(entity_id)
            .or_default()
            .insert(socket_id);
        (socket_id, rx)
    }

    /// Disconnect cleanup: drop the socket from every index.
    pub fn unregister(&self, socket_id: Uuid) {
        let mut state = self.locked();
        if let Some(entry) = state.sockets.remove(&socket_id) {
            let entity_id = entry.entity_id;
            if let Some(set) = state.entity_sockets.get_mut(&entity_id) {
                set.remove(&socket_id);
                if set.is_empty() {
                    state.entity_sockets.remove(&entity_id);
                }
            }
        }
        state.socket_agent.remove(&socket_id);
        state.log_subscriptions.remove(&socket_id);
        for members in state.rooms.values_mut() {
            members.remove(&socket_id);
        }
        state.rooms.retain(|_, members| !members.is_empty());
    }

    pub fn join_room(&self, socket_id: Uuid, channel_id: Uuid) {
        self.locked()
            .rooms
            .entry(channel_id)
            .or_default()
            .insert(socket_id);
    }

    pub fn leave_room(&self, socket_id: Uuid, channel_id: Uuid) {
        let mut state = self.locked();
        if let Some(members) = state.rooms.get_mut(&channel_id) {
            members.remove(&socket_id);
            if members.is_empty() {
                state.rooms.remove(&channel_id);
            }
        }
    }

    pub fn associate_agent(&self, socket_id: Uuid, agent_id: Uuid) {
        self.locked().socket_agent.insert(socket_id, agent_id);
    }

    pub fn emit_to(&self, socket_id: Uuid, frame: Outbound) {
        let state = self.locked();
        if let Some(entry) = state.sockets.get(&socket_id) {
            let _ = entry.sender.send(frame);
        }
    }

    /// Broadcast to every socket in a channel room, optionally excluding
    /// one (typically the sender).
    pub fn broadcast_to_room(&self, channel_id: Uuid, frame: &Outbound, except: Option<Uuid>) {
        let state = self.locked();
        let Some(members) = state.rooms.get(&channel_id) else {
            return;
        };
        for socket_id in members {
            if Some(*socket_id) == except {
                continue;
            }
            if let Some(entry) = state.sockets.get(socket_id) {
                let _ = entry.sender.send(frame.clone());
            }
        }
    }

    pub fn room_size(&self, channel_id: Uuid) -> usize {
        self.locked().rooms.get(&channel_id).map_or(0, HashSet::len)
    }

    pub fn connected_sockets(&self) -> usize {
        self.locked().sockets.len()
    }

    // ==================== Log Streaming ====================

    pub fn subscribe_logs(&self, socket_id: Uuid, filter: LogFilter) {
        self.locked().log_subscriptions.insert(socket_id, filter);
    }

    pub fn unsubscribe_logs(&self, socket_id: Uuid) {
        self.locked().log_subscriptions.remove(&socket_id);
    }

    /// Update filters for an existing subscription; a no-op for sockets
    /// that never subscribed.
    pub fn update_log_filters(&self, socket_id: Uuid, filter: LogFilter) -> bool {
        let mut state = self.locked();
        if state.log_subscriptions.contains_key(&socket_id) {
            state.log_subscriptions.insert(socket_id, filter);
            true
        } else {
            false
        }
    }

    /// Forward a log entry to every subscribed socket whose filter matches.
    pub fn broadcast_log(&self, entry: &LogEntry) {
        let state = self.locked();
        if state.log_subscriptions.is_empty() {
            return;
        }
        let frame = Outbound::new(EVT_LOG_STREAM, entry.to_value());
        for (socket_id, filter) in &state.log_subscriptions {
            if !filter.matches(entry) {
                continue;
            }
            if let Some(socket) = state.sockets.get(socket_id) {
                let _ = socket.sender.send(frame.clone());
            }
        }
    }

    // ==================== Bus Relay ====================

    /// Relay stream chunk/error bus events into their channel rooms.
    pub async fn attach_bus(self: &Arc<Self>, bus: &MessageBus) {
        let hub = self.clone();
        let chunk_id = bus
            .subscribe(Topic::MessageStreamChunk, move |payload| {
                let hub = hub.clone();
                Box::pin(async move {
                    hub.relay_stream_event(EVT_STREAM_CHUNK, &payload);
                    Ok(())
                })
            })
            .await;

        let hub = self.clone();
        let error_id = bus
            .subscribe(Topic::MessageStreamError, move |payload| {
                let hub = hub.clone();
                Box::pin(async move {
                    hub.relay_stream_event(EVT_STREAM_ERROR, &payload);
                    Ok(())
                })
            })
            .await;

        let mut subs = match self.bus_subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.push((Topic::MessageStreamChunk, chunk_id));
        subs.push((Topic::MessageStreamError, error_id));
    }

    fn relay_stream_event(&self, event: &str, payload: &Value) {
        let Some(channel_id) = payload
            .get("channelId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::try_parse(s).ok())
        else {
            tracing::warn!(event, "stream relay event without channelId, dropping");
            return;
        };
        self.broadcast_to_room(channel_id, &Outbound::new(event, payload.clone()), None);
    }

    /// Detach bus subscriptions and drop all socket state.
    pub async fn cleanup(&self, bus: &MessageBus) {
        let subs: Vec<(Topic, SubscriptionId)> = {
            let mut guard = match self.bus_subscriptions.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.drain(..).collect()
        };
        for (topic, id) in subs {
            bus.unsubscribe(topic, id).await;
        }
        let mut state = self.locked();
        state.sockets.clear();
        state.rooms.clear();
        state.entity_sockets.clear();
        state.socket_agent.clear();
        state.log_subscriptions.clear();
    }
}

/// Build a `messageError` frame body.
pub fn message_error(message: &str, code: &str) -> Outbound {
    Outbound::new(
        protocol::EVT_MESSAGE_ERROR,
        json!({ "error": message, "code": code }),
    )
}
