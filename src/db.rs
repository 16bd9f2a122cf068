//! Persistence store for servers, channels, participants, messages, and
//! agent-server associations.
//!
//! The core owns only derived views of this data; sessions and jobs stay in
//! memory and hold identifiers into these tables.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("message server not found: {0}")]
    ServerNotFound(Uuid),
    #[error("channel not found: {0}")]
    ChannelNotFound(Uuid),
    #[error("message not found: {0}")]
    MessageNotFound(Uuid),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe store handle
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ==================== Server Operations ====================

    /// Create a message server, optionally with a fixed id (bootstrap).
    pub fn create_server(
        &self,
        id: Option<Uuid>,
        name: &str,
        source_type: &str,
        source_id: Option<&str>,
        metadata: Option<&Value>,
    ) -> StoreResult<MessageServer> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();
        {
            let conn = self.lock();
            conn.execute(
                "INSERT OR IGNORE INTO message_servers (id, name, source_type, source_id, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    id.to_string(),
                    name,
                    source_type,
                    source_id,
                    metadata.map(Value::to_string),
                    now.to_rfc3339()
                ],
            )?;
        }
        self.get_server(id)
    }

    pub fn get_server(&self, id: Uuid) -> StoreResult<MessageServer> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, source_type, source_id, metadata, created_at, updated_at
             FROM message_servers WHERE id = ?1",
            params![id.to_string()],
            map_server,
        )
        .optional()?
        .ok_or(StoreError::ServerNotFound(id))
    }

    pub fn get_server_by_source_id(&self, source_id: &str) -> StoreResult<Option<MessageServer>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, source_type, source_id, metadata, created_at, updated_at
                 FROM message_servers WHERE source_id = ?1",
                params![source_id],
                map_server,
            )
            .optional()?)
    }

    pub fn list_servers(&self) -> StoreResult<Vec<MessageServer>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, source_type, source_id, metadata, created_at, updated_at
             FROM message_servers ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], map_server)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn server_exists(&self, id: Uuid) -> StoreResult<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM message_servers WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ==================== Channel Operations ====================

    /// Create a channel with its initial participant set. Participants are
    /// deduplicated by the primary key.
    pub fn create_channel(&self, new: &NewChannel) -> StoreResult<Channel> {
        let id = new.id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();
        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO channels (id, server_id, name, type, source_type, topic, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id.to_string(),
                    new.message_server_id.to_string(),
                    new.name,
                    new.channel_type.as_str(),
                    new.source_type,
                    new.topic,
                    new.metadata.as_ref().map(Value::to_string),
                    now.to_rfc3339()
                ],
            )?;
            for user_id in &new.participants {
                tx.execute(
                    "INSERT OR IGNORE INTO channel_participants (channel_id, user_id) VALUES (?1, ?2)",
                    params![id.to_string(), user_id.to_string()],
                )?;
            }
            tx.commit()?;
        }
        self.get_channel(id)
    }

    pub fn get_channel(&self, id: Uuid) -> StoreResult<Channel> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, server_id, name, type, source_type, topic, metadata, created_at, updated_at
             FROM channels WHERE id = ?1",
            params![id.to_string()],
            map_channel,
        )
        .optional()?
        .ok_or(StoreError::ChannelNotFound(id))
    }

    pub fn channel_exists(&self, id: Uuid) -> StoreResult<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM channels WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn update_channel(&self, id: Uuid, patch: &ChannelPatch) -> StoreResult<Channel> {
        let now = Utc::now();
        {
            let conn = self.lock();
            let updated = conn.execute(
                "UPDATE channels SET
                     name = COALESCE(?2, name),
                     topic = COALESCE(?3, topic),
                     metadata = COALESCE(?4, metadata),
                     updated_at = ?5
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    patch.name,
                    patch.topic,
                    patch.metadata.as_ref().map(Value::to_string),
                    now.to_rfc3339()
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::ChannelNotFound(id));
            }
        }
        self.get_channel(id)
    }

    pub fn delete_channel(&self, id: Uuid) -> StoreResult<()> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM channels WHERE id = ?1", params![id.to_string()])?;
        if deleted == 0 {
            return Err(StoreError::ChannelNotFound(id));
        }
        Ok(())
    }

    pub fn list_channels(&self, server_id: Uuid) -> StoreResult<Vec<Channel>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, server_id, name, type, source_type, topic, metadata, created_at, updated_at
             FROM channels WHERE server_id = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(params![server_id.to_string()], map_channel)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn participants(&self, channel_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id FROM channel_participants WHERE channel_id = ?1 ORDER BY user_id",
        )?;
        let rows = stmt.query_map(params![channel_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for raw in rows {
            if let Ok(id) = Uuid::try_parse(&raw?) {
                out.push(id);
            }
        }
        Ok(out)
    }

    pub fn is_participant(&self, channel_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM channel_participants WHERE channel_id = ?1 AND user_id = ?2",
            params![channel_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn add_participants(&self, channel_id: Uuid, user_ids: &[Uuid]) -> StoreResult<()> {
        if !self.channel_exists(channel_id)? {
            return Err(StoreError::ChannelNotFound(channel_id));
        }
        let conn = self.lock();
        for user_id in user_ids {
            conn.execute(
                "INSERT OR IGNORE INTO channel_participants (channel_id, user_id) VALUES (?1, ?2)",
                params![channel_id.to_string(), user_id.to_string()],
            )?;
        }
        Ok(())
    }

    pub fn remove_participant(&self, channel_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM channel_participants WHERE channel_id = ?1 AND user_id = ?2",
            params![channel_id.to_string(), user_id.to_string()],
        )?;
        Ok(())
    }

    /// Find the two-party DM between `a` and `b` on a server, creating it
    /// when absent.
    pub fn find_or_create_dm(
        &self,
        server_id: Uuid,
        a: Uuid,
        b: Uuid,
        name: &str,
        metadata: Option<Value>,
    ) -> StoreResult<Channel> {
        let existing: Option<String> = {
            let conn = self.lock();
            conn.query_row(
                "SELECT c.id FROM channels c
                 JOIN channel_participants p1 ON p1.channel_id = c.id AND p1.user_id = ?2
                 JOIN channel_participants p2 ON p2.channel_id = c.id AND p2.user_id = ?3
                 WHERE c.server_id = ?1 AND c.type = 'DM'
                   AND (SELECT COUNT(*) FROM channel_participants p WHERE p.channel_id = c.id) = 2
                 LIMIT 1",
                params![server_id.to_string(), a.to_string(), b.to_string()],
                |row| row.get(0),
            )
            .optional()?
        };

        if let Some(raw) = existing {
            if let Ok(id) = Uuid::try_parse(&raw) {
                return self.get_channel(id);
            }
        }

        self.create_channel(&NewChannel {
            id: None,
            message_server_id: server_id,
            name: name.to_string(),
            channel_type: ChannelType::Dm,
            source_type: None,
            topic: None,
            metadata,
            participants: vec![a, b],
        })
    }

    // ==================== Message Operations ====================

    pub fn create_message(&self, new: &NewMessage) -> StoreResult<Message> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO messages (id, channel_id, author_id, content, raw_message, source_type, source_id, in_reply_to_root_message_id, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    id.to_string(),
                    new.channel_id.to_string(),
                    new.author_id.to_string(),
                    new.content,
                    new.raw_message.as_ref().map(Value::to_string),
                    new.source_type,
                    new.source_id,
                    new.in_reply_to_root_message_id.map(|m| m.to_string()),
                    new.metadata.as_ref().map(Value::to_string),
                    now.to_rfc3339()
                ],
            )?;
        }
        self.get_message(id)
    }

    pub fn get_message(&self, id: Uuid) -> StoreResult<Message> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, channel_id, author_id, content, raw_message, source_type, source_id, in_reply_to_root_message_id, metadata, created_at, updated_at
             FROM messages WHERE id = ?1",
            params![id.to_string()],
            map_message,
        )
        .optional()?
        .ok_or(StoreError::MessageNotFound(id))
    }

    pub fn update_message_content(&self, id: Uuid, content: &str) -> StoreResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE messages SET content = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), content, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(StoreError::MessageNotFound(id));
        }
        Ok(())
    }

    pub fn delete_message(&self, id: Uuid) -> StoreResult<()> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM messages WHERE id = ?1", params![id.to_string()])?;
        if deleted == 0 {
            return Err(StoreError::MessageNotFound(id));
        }
        Ok(())
    }

    /// Newest first; `before` bounds on creation time (exclusive).
    pub fn list_messages(
        &self,
        channel_id: Uuid,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Message>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, channel_id, author_id, content, raw_message, source_type, source_id, in_reply_to_root_message_id, metadata, created_at, updated_at
             FROM messages
             WHERE channel_id = ?1 AND (?2 IS NULL OR created_at < ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        #[allow(clippy::cast_possible_wrap)]
        let rows = stmt.query_map(
            params![
                channel_id.to_string(),
                before.map(|t| t.to_rfc3339()),
                limit as i64
            ],
            map_message,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_messages(&self, channel_id: Uuid) -> StoreResult<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE channel_id = ?1",
            params![channel_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Delete up to `batch` messages from a channel, oldest first. Returns
    /// the number deleted so callers can loop until the channel drains.
    pub fn delete_channel_messages_batch(
        &self,
        channel_id: Uuid,
        batch: usize,
    ) -> StoreResult<usize> {
        let conn = self.lock();
        #[allow(clippy::cast_possible_wrap)]
        let deleted = conn.execute(
            "DELETE FROM messages WHERE id IN (
                 SELECT id FROM messages WHERE channel_id = ?1 ORDER BY created_at ASC LIMIT ?2
             )",
            params![channel_id.to_string(), batch as i64],
        )?;
        Ok(deleted)
    }

    // ==================== Agent-Server Operations ====================

    pub fn add_agent_to_server(&self, server_id: Uuid, agent_id: Uuid) -> StoreResult<()> {
        if !self.server_exists(server_id)? {
            return Err(StoreError::ServerNotFound(server_id));
        }
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO server_agents (server_id, agent_id) VALUES (?1, ?2)",
            params![server_id.to_string(), agent_id.to_string()],
        )?;
        Ok(())
    }

    pub fn remove_agent_from_server(&self, server_id: Uuid, agent_id: Uuid) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM server_agents WHERE server_id = ?1 AND agent_id = ?2",
            params![server_id.to_string(), agent_id.to_string()],
        )?;
        Ok(())
    }

    pub fn list_agents_for_server(&self, server_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT agent_id FROM server_agents WHERE server_id = ?1 ORDER BY agent_id")?;
        let rows = stmt.query_map(params![server_id.to_string()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            if let Ok(id) = Uuid::try_parse(&raw?) {
                out.push(id);
            }
        }
        Ok(out)
    }

    pub fn list_servers_for_agent(&self, agent_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT server_id FROM server_agents WHERE agent_id = ?1 ORDER BY server_id")?;
        let rows = stmt.query_map(params![agent_id.to_string()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            if let Ok(id) = Uuid::try_parse(&raw?) {
                out.push(id);
            }
        }
        Ok(out)
    }
}

// ==================== Row Mapping ====================

fn parse_uuid_column(raw: &str) -> Uuid {
    Uuid::try_parse(raw).unwrap_or_default()
}

fn parse_datetime(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_json_column(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn map_server(row: &Row<'_>) -> rusqlite::Result<MessageServer> {
    Ok(MessageServer {
        id: parse_uuid_column(&row.get::<_, String>(0)?),
        name: row.get(1)?,
        source_type: row.get(2)?,
        source_id: row.get(3)?,
        metadata: parse_json_column(row.get(4)?),
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        updated_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn map_channel(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: parse_uuid_column(&row.get::<_, String>(0)?),
        message_server_id: parse_uuid_column(&row.get::<_, String>(1)?),
        name: row.get(2)?,
        channel_type: ChannelType::parse(&row.get::<_, String>(3)?),
        source_type: row.get(4)?,
        topic: row.get(5)?,
        metadata: parse_json_column(row.get(6)?),
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        updated_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: parse_uuid_column(&row.get::<_, String>(0)?),
        channel_id: parse_uuid_column(&row.get::<_, String>(1)?),
        author_id: parse_uuid_column(&row.get::<_, String>(2)?),
        content: row.get(3)?,
        raw_message: parse_json_column(row.get(4)?),
        source_type: row.get(5)?,
        source_id: row.get(6)?,
        in_reply_to_root_message_id: row
            .get::<_, Option<String>>(7)?
            .and_then(|s| Uuid::try_parse(&s).ok()),
        metadata: parse_json_column(row.get(8)?),
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}
