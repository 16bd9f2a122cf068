//! Log stream fanout: a `tracing` layer that forwards events to socket
//! subscribers through the hub.
//!
//! Levels are numeric on the wire so clients can filter with a simple
//! floor comparison.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use super::SocketHub;

pub const LEVEL_TRACE: u8 = 10;
pub const LEVEL_DEBUG: u8 = 20;
pub const LEVEL_INFO: u8 = 30;
pub const LEVEL_WARN: u8 = 40;
pub const LEVEL_ERROR: u8 = 50;

fn numeric_level(level: &Level) -> u8 {
    match *level {
        Level::TRACE => LEVEL_TRACE,
        Level::DEBUG => LEVEL_DEBUG,
        Level::INFO => LEVEL_INFO,
        Level::WARN => LEVEL_WARN,
        Level::ERROR => LEVEL_ERROR,
    }
}

/// One event on its way to `log_stream` subscribers.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: u8,
    pub message: String,
    pub agent_name: Option<String>,
    pub time_ms: i64,
    pub fields: Value,
}

impl LogEntry {
    pub fn to_value(&self) -> Value {
        let mut out = json!({
            "level": self.level,
            "msg": self.message,
            "time": self.time_ms,
        });
        if let Some(agent) = &self.agent_name {
            out["agentName"] = Value::String(agent.clone());
        }
        if let Some(fields) = self.fields.as_object() {
            for (key, value) in fields {
                out[key] = value.clone();
            }
        }
        out
    }
}

/// Tracing layer feeding the socket log stream.
///
/// Events are handed off over an unbounded channel so emission never blocks
/// a traced call site; a background task drains into the hub.
pub struct SocketLogLayer {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl SocketLogLayer {
    pub fn new(hub: Arc<SocketHub>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogEntry>();
        let forwarder = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                hub.broadcast_log(&entry);
            }
        });
        (Self { tx }, forwarder)
    }
}

impl<S: Subscriber> Layer<S> for SocketLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let agent_name = visitor
            .fields
            .remove("agent_name")
            .or_else(|| visitor.fields.remove("agentName"))
            .and_then(|v| v.as_str().map(str::to_string));

        let entry = LogEntry {
            level: numeric_level(event.metadata().level()),
            message: visitor.message.unwrap_or_default(),
            agent_name,
            time_ms: chrono::Utc::now().timestamp_millis(),
            fields: Value::Object(visitor.fields),
        };
        let _ = self.tx.send(entry);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, json!(value));
    }
}
