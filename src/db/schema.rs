//! Store schema and row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS message_servers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    source_type TEXT NOT NULL,
    source_id TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    server_id TEXT NOT NULL,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    source_type TEXT,
    topic TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (server_id) REFERENCES message_servers(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_channels_server ON channels(server_id);

CREATE TABLE IF NOT EXISTS channel_participants (
    channel_id TEXT NOT NULL,
    user_id TEXT NOT NULL,

    PRIMARY KEY (channel_id, user_id),
    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    author_id TEXT NOT NULL,
    content TEXT NOT NULL,
    raw_message TEXT,
    source_type TEXT,
    source_id TEXT,
    in_reply_to_root_message_id TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_id, created_at DESC);

CREATE TABLE IF NOT EXISTS server_agents (
    server_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,

    PRIMARY KEY (server_id, agent_id),
    FOREIGN KEY (server_id) REFERENCES message_servers(id) ON DELETE CASCADE
);
";

/// A message server: the root container channels hang off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageServer {
    pub id: Uuid,
    pub name: String,
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// DM channels carry exactly two participants at creation; groups carry one
/// or more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    #[serde(rename = "DM")]
    Dm,
    #[serde(rename = "GROUP")]
    Group,
}

impl ChannelType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dm => "DM",
            Self::Group => "GROUP",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "DM" => Self::Dm,
            _ => Self::Group,
        }
    }
}

/// A conversation container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: Uuid,
    pub message_server_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to_root_message_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a new message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub raw_message: Option<Value>,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub in_reply_to_root_message_id: Option<Uuid>,
    pub metadata: Option<Value>,
}

/// Fields for creating a new channel.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub id: Option<Uuid>,
    pub message_server_id: Uuid,
    pub name: String,
    pub channel_type: ChannelType,
    pub source_type: Option<String>,
    pub topic: Option<String>,
    pub metadata: Option<Value>,
    pub participants: Vec<Uuid>,
}

/// Partial channel update.
#[derive(Debug, Clone, Default)]
pub struct ChannelPatch {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub metadata: Option<Value>,
}
