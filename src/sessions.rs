//! Stateful, timed conversations wrapped around DM channels.
//!
//! Sessions live only in memory; the backing channel is persisted and
//! retained after the session ends. Expiry is checked on every access, and
//! a periodic sweep removes what access never touches.

pub mod timeout;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionDefaults;
use crate::db::{ChannelType, Message, NewChannel};
use crate::error::{ApiError, ErrorCode};
use crate::messages::{MessageService, PostMessage};
use crate::runtime::RuntimeRegistry;
use timeout::{
    can_renew, compute_expiry, is_near_expiration, merge_config, time_remaining_ms, TimeoutConfig,
    TimeoutConfigPatch,
};

const DEFAULT_SESSION_PAGE: usize = 50;
const MAX_SESSION_PAGE: usize = 100;

/// Warning bookkeeping: set once per quiet period, cleared by renewal.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningState {
    pub sent: bool,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub timeout_config: TimeoutConfig,
    pub renewal_count: u64,
    pub warning_state: Option<WarningState>,
}

impl Session {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// In-memory sessions cannot be arbitrarily malformed, but a bug that
    /// breaks the timing invariants must not keep a zombie alive.
    fn is_structurally_valid(&self) -> bool {
        self.expires_at >= self.created_at
            && self.last_activity >= self.created_at
            && self.timeout_config.timeout_minutes > 0
            && self.timeout_config.max_duration_minutes >= self.timeout_config.timeout_minutes
    }

    /// Auto/manual renewal. Returns false once the hard duration ceiling
    /// is reached.
    fn try_renew(&mut self, now: DateTime<Utc>) -> bool {
        if !can_renew(self.created_at, now, &self.timeout_config) {
            return false;
        }
        self.last_activity = now;
        self.renewal_count += 1;
        self.expires_at = compute_expiry(self.created_at, self.last_activity, &self.timeout_config);
        self.warning_state = None;
        true
    }

    fn mark_warning_if_due(&mut self, now: DateTime<Utc>) {
        if self.warning_state.is_some_and(|w| w.sent) {
            return;
        }
        if is_near_expiration(self.expires_at, now, &self.timeout_config) {
            self.warning_state = Some(WarningState {
                sent: true,
                sent_at: now,
            });
        }
    }

    fn view(&self, now: DateTime<Utc>) -> SessionView {
        SessionView {
            session_id: self.id,
            agent_id: self.agent_id,
            channel_id: self.channel_id,
            user_id: self.user_id,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            expires_at: self.expires_at,
            timeout_config: self.timeout_config,
            renewal_count: self.renewal_count,
            time_remaining: time_remaining_ms(self.expires_at, now),
            is_near_expiration: is_near_expiration(self.expires_at, now, &self.timeout_config),
            warning_state: self.warning_state,
        }
    }

    fn status(&self, now: DateTime<Utc>, was_renewed: bool) -> SessionStatus {
        SessionStatus {
            expires_at: self.expires_at,
            renewal_count: self.renewal_count,
            was_renewed,
            is_near_expiration: is_near_expiration(self.expires_at, now, &self.timeout_config),
        }
    }
}

/// Derived, client-facing view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub timeout_config: TimeoutConfig,
    pub renewal_count: u64,
    /// Milliseconds until expiry, floored at zero.
    pub time_remaining: i64,
    pub is_near_expiration: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_state: Option<WarningState>,
}

/// Session state attached to message-send responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub expires_at: DateTime<Utc>,
    pub renewal_count: u64,
    pub was_renewed: bool,
    pub is_near_expiration: bool,
}

/// Result of routing one message through a session.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub message: Message,
    pub status: SessionStatus,
    pub agent_id: Uuid,
    pub channel_id: Uuid,
    pub user_id: Uuid,
}

/// One page of session messages.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessagesPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub cursors: PageCursors,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCursors {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<i64>,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<Uuid, Session>>,
    agent_timeouts: Mutex<HashMap<Uuid, TimeoutConfig>>,
    defaults: SessionDefaults,
    service: Arc<MessageService>,
    registry: Arc<RuntimeRegistry>,
    started_at: Instant,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        service: Arc<MessageService>,
        registry: Arc<RuntimeRegistry>,
        defaults: SessionDefaults,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            agent_timeouts: Mutex::new(HashMap::new()),
            defaults,
            service,
            registry,
            started_at: Instant::now(),
            sweeper: Mutex::new(None),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Session>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Per-agent timeout overrides, consulted between request values and
    /// global defaults.
    pub fn cache_agent_timeout(&self, agent_id: Uuid, config: TimeoutConfig) {
        if let Ok(mut cache) = self.agent_timeouts.lock() {
            cache.insert(agent_id, config);
        }
    }

    fn agent_timeout(&self, agent_id: Uuid) -> Option<TimeoutConfig> {
        self.agent_timeouts
            .lock()
            .ok()
            .and_then(|cache| cache.get(&agent_id).copied())
    }

    pub async fn create(
        &self,
        agent_id: Uuid,
        user_id: Uuid,
        metadata: Option<Value>,
        patch: Option<TimeoutConfigPatch>,
    ) -> Result<SessionView, ApiError> {
        if !self.registry.contains(agent_id).await {
            return Err(ApiError::new(
                ErrorCode::AgentNotFound,
                format!("agent {agent_id} is not available"),
            ));
        }

        let agent_config = self.agent_timeout(agent_id);
        let config = merge_config(patch.as_ref(), agent_config.as_ref(), &self.defaults);

        let session_id = Uuid::new_v4();
        let now = Utc::now();

        let channel_metadata = json!({
            "sessionId": session_id.to_string(),
            "session": true,
            "timeoutConfig": config,
        });
        let id_prefix: String = session_id.to_string().chars().take(8).collect();
        let channel = self
            .service
            .store()
            .create_channel(&NewChannel {
                id: None,
                message_server_id: self.service.current_server_id(),
                name: format!("Session {id_prefix}"),
                channel_type: ChannelType::Dm,
                source_type: Some("session".to_string()),
                topic: None,
                metadata: Some(channel_metadata),
                participants: vec![user_id, agent_id],
            })
            .map_err(|err| {
                tracing::error!(error = %err, "failed to create session channel");
                ApiError::new(ErrorCode::SessionCreationError, "could not create session")
            })?;

        let session = Session {
            id: session_id,
            agent_id,
            channel_id: channel.id,
            user_id,
            metadata: metadata.unwrap_or_else(|| Value::Object(Map::new())),
            created_at: now,
            last_activity: now,
            expires_at: compute_expiry(now, now, &config),
            timeout_config: config,
            renewal_count: 0,
            warning_state: None,
        };
        let view = session.view(now);
        self.locked().insert(session_id, session);

        tracing::info!(
            session_id = %session_id,
            agent_id = %agent_id,
            channel_id = %channel.id,
            timeout_minutes = config.timeout_minutes,
            "session created"
        );
        Ok(view)
    }

    /// Expiry is checked on every access; an expired session is removed and
    /// the access fails with `SESSION_EXPIRED`.
    pub fn get(&self, session_id: Uuid) -> Result<SessionView, ApiError> {
        let now = Utc::now();
        let mut sessions = self.locked();
        let Some(session) = sessions.get_mut(&session_id) else {
            return Err(session_not_found(session_id));
        };
        if session.is_expired(now) {
            sessions.remove(&session_id);
            return Err(session_expired(session_id));
        }
        session.mark_warning_if_due(now);
        Ok(session.view(now))
    }

    /// Route a user message through the session: auto-renew, stamp the
    /// session id into message metadata, persist via the message service.
    pub async fn send_message(
        &self,
        session_id: Uuid,
        content: String,
        attachments: Option<Value>,
        request_metadata: Option<Value>,
    ) -> Result<SessionMessage, ApiError> {
        crate::validate::validate_content(&content)?;
        crate::validate::validate_metadata(request_metadata.as_ref())?;

        let now = Utc::now();
        // Update lifecycle state under the lock, then persist outside it.
        let (snapshot, was_renewed) = {
            let mut sessions = self.locked();
            let Some(session) = sessions.get_mut(&session_id) else {
                return Err(session_not_found(session_id));
            };
            if session.is_expired(now) {
                sessions.remove(&session_id);
                return Err(session_expired(session_id));
            }

            let was_renewed = if session.timeout_config.auto_renew {
                session.try_renew(now)
            } else {
                // Activity is still observed; expiry stays put.
                session.last_activity = now;
                false
            };
            (session.clone(), was_renewed)
        };

        let channel_metadata = self
            .service
            .get_channel(snapshot.channel_id)
            .ok()
            .and_then(|c| c.metadata);

        let mut metadata = Map::new();
        if let Some(Value::Object(map)) = channel_metadata {
            metadata.extend(map);
        }
        metadata.insert(
            "sessionId".to_string(),
            Value::String(session_id.to_string()),
        );
        if let Some(attachments) = attachments {
            metadata.insert("attachments".to_string(), attachments);
        }
        if let Some(Value::Object(map)) = request_metadata {
            metadata.extend(map);
        }

        let message = self
            .service
            .post_message(PostMessage {
                channel_id: snapshot.channel_id,
                author_id: snapshot.user_id,
                message_server_id: self.service.current_server_id(),
                content,
                in_reply_to_message_id: None,
                raw_message: None,
                metadata: Some(Value::Object(metadata)),
                source_type: Some("session_message".to_string()),
                source_id: None,
                author_display_name: snapshot
                    .metadata
                    .get("user_display_name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .await
            .map_err(|err| {
                if err.code == ErrorCode::ForbiddenServerMismatch {
                    err
                } else if matches!(
                    err.code,
                    ErrorCode::InvalidContent | ErrorCode::ContentTooLarge | ErrorCode::InvalidMetadata
                ) {
                    err
                } else {
                    tracing::error!(session_id = %session_id, error = %err, "session message send failed");
                    ApiError::new(ErrorCode::MessageSendError, "failed to send session message")
                }
            })?;

        Ok(SessionMessage {
            status: snapshot.status(now, was_renewed),
            agent_id: snapshot.agent_id,
            channel_id: snapshot.channel_id,
            user_id: snapshot.user_id,
            message,
        })
    }

    /// Bounded pagination over the session channel. Range queries fetch a
    /// scaled window and filter in memory.
    pub fn get_messages(
        &self,
        session_id: Uuid,
        limit: Option<usize>,
        before: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
    ) -> Result<SessionMessagesPage, ApiError> {
        let channel_id = {
            let sessions = self.locked();
            let Some(session) = sessions.get(&session_id) else {
                return Err(session_not_found(session_id));
            };
            session.channel_id
        };

        let limit = limit.unwrap_or(DEFAULT_SESSION_PAGE).clamp(1, MAX_SESSION_PAGE);
        let window = if after.is_some() { limit * 3 } else { limit + 1 };

        let fetched = self
            .service
            .get_messages(channel_id, Some(window), before)?;

        let mut filtered: Vec<Message> = match after {
            Some(after) => fetched
                .into_iter()
                .filter(|m| m.created_at > after)
                .collect(),
            None => fetched,
        };

        let has_more = filtered.len() > limit;
        filtered.truncate(limit);

        let cursors = PageCursors {
            before: filtered.last().map(|m| m.created_at.timestamp_millis()),
            after: filtered.first().map(|m| m.created_at.timestamp_millis()),
        };

        Ok(SessionMessagesPage {
            messages: filtered,
            has_more,
            cursors,
        })
    }

    /// Manual renewal, honored even with `autoRenew` off. Fails once the
    /// session has lived out its maximum duration.
    pub fn renew(&self, session_id: Uuid) -> Result<SessionView, ApiError> {
        let now = Utc::now();
        let mut sessions = self.locked();
        let Some(session) = sessions.get_mut(&session_id) else {
            return Err(session_not_found(session_id));
        };
        if session.is_expired(now) {
            sessions.remove(&session_id);
            return Err(session_expired(session_id));
        }
        if !session.try_renew(now) {
            return Err(ApiError::new(
                ErrorCode::SessionRenewalFailed,
                "session has reached its maximum duration",
            ));
        }
        Ok(session.view(now))
    }

    pub fn update_timeout(
        &self,
        session_id: Uuid,
        patch: &TimeoutConfigPatch,
    ) -> Result<SessionView, ApiError> {
        if patch.is_empty() {
            return Err(ApiError::new(
                ErrorCode::InvalidTimeoutConfig,
                "no timeout fields provided",
            ));
        }
        let now = Utc::now();
        let mut sessions = self.locked();
        let Some(session) = sessions.get_mut(&session_id) else {
            return Err(session_not_found(session_id));
        };
        if session.is_expired(now) {
            sessions.remove(&session_id);
            return Err(session_expired(session_id));
        }

        session.timeout_config =
            merge_config(Some(patch), Some(&session.timeout_config), &self.defaults);
        session.expires_at =
            compute_expiry(session.created_at, session.last_activity, &session.timeout_config);
        session.mark_warning_if_due(now);
        Ok(session.view(now))
    }

    /// Heartbeat observes activity; it only extends the session when
    /// auto-renew is on.
    pub fn heartbeat(&self, session_id: Uuid) -> Result<SessionView, ApiError> {
        let now = Utc::now();
        let mut sessions = self.locked();
        let Some(session) = sessions.get_mut(&session_id) else {
            return Err(session_not_found(session_id));
        };
        if session.is_expired(now) {
            sessions.remove(&session_id);
            return Err(session_expired(session_id));
        }

        // Activity is observed unconditionally; only auto-renew touches
        // the expiry.
        session.last_activity = now;
        if session.timeout_config.auto_renew {
            session.try_renew(now);
        }
        Ok(session.view(now))
    }

    /// Remove the session; the backing channel is retained.
    pub fn delete(&self, session_id: Uuid) -> Result<(), ApiError> {
        let removed = self.locked().remove(&session_id);
        if removed.is_none() {
            return Err(session_not_found(session_id));
        }
        tracing::info!(session_id = %session_id, "session deleted");
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionView> {
        let now = Utc::now();
        self.locked()
            .values()
            .filter(|s| !s.is_expired(now))
            .map(|s| s.view(now))
            .collect()
    }

    pub fn health(&self) -> Value {
        let now = Utc::now();
        let sessions = self.locked();
        let active = sessions.values().filter(|s| !s.is_expired(now)).count();
        let expiring = sessions
            .values()
            .filter(|s| {
                !s.is_expired(now) && is_near_expiration(s.expires_at, now, &s.timeout_config)
            })
            .count();
        let invalid = sessions
            .values()
            .filter(|s| !s.is_structurally_valid())
            .count();
        json!({
            "status": "healthy",
            "activeSessions": active,
            "expiringSoon": expiring,
            "invalidSessions": invalid,
            "timestamp": now.to_rfc3339(),
            "uptime": self.started_at.elapsed().as_secs(),
        })
    }

    /// One sweep pass: drop malformed sessions, drop expired ones, mark
    /// warnings on the rest.
    pub fn sweep(&self) -> (usize, usize) {
        let now = Utc::now();
        let mut sessions = self.locked();

        let malformed: Vec<Uuid> = sessions
            .values()
            .filter(|s| !s.is_structurally_valid())
            .map(|s| s.id)
            .collect();
        for id in &malformed {
            tracing::warn!(session_id = %id, "removing structurally invalid session");
            sessions.remove(id);
        }

        let expired: Vec<Uuid> = sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id)
            .collect();
        for id in &expired {
            tracing::info!(session_id = %id, "sweeping expired session");
            sessions.remove(id);
        }

        for session in sessions.values_mut() {
            session.mark_warning_if_due(now);
        }

        (expired.len(), malformed.len())
    }

    /// Start the periodic sweep task.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval_minutes = self.defaults.cleanup_interval_minutes.max(1);
        let handle = tokio::spawn(async move {
            #[allow(clippy::cast_sign_loss)]
            let period = std::time::Duration::from_secs(interval_minutes as u64 * 60);
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let (expired, malformed) = manager.sweep();
                if expired > 0 || malformed > 0 {
                    tracing::debug!(expired, malformed, "session sweep complete");
                }
            }
        });
        if let Ok(mut sweeper) = self.sweeper.lock() {
            *sweeper = Some(handle);
        }
    }

    /// Stop the sweep task and optionally drop all sessions.
    pub fn cleanup(&self, clear_sessions: bool) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
        if clear_sessions {
            self.locked().clear();
        }
    }

    #[cfg(test)]
    fn with_session_mut(&self, session_id: Uuid, f: impl FnOnce(&mut Session)) {
        let mut sessions = self.locked();
        if let Some(session) = sessions.get_mut(&session_id) {
            f(session);
        }
    }
}

fn session_not_found(id: Uuid) -> ApiError {
    ApiError::new(ErrorCode::SessionNotFound, format!("session {id} not found"))
}

fn session_expired(id: Uuid) -> ApiError {
    ApiError::new(ErrorCode::SessionExpired, format!("session {id} has expired"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::db::Store;
    use crate::runtime::EchoRuntime;
    use crate::socket::SocketHub;
    use chrono::Duration;
    use serde_json::json;

    async fn manager() -> (Arc<SessionManager>, Uuid) {
        let store = Store::open_in_memory().unwrap();
        let server = store
            .create_server(None, "Test Server", "test", None, None)
            .unwrap();
        let bus = Arc::new(MessageBus::new());
        let hub = Arc::new(SocketHub::new());
        let service = Arc::new(MessageService::new(store, bus, hub, server.id));

        let registry = Arc::new(RuntimeRegistry::new());
        let agent_id = Uuid::new_v4();
        registry
            .register(Arc::new(EchoRuntime::new(agent_id, "echo")))
            .await;

        let manager = Arc::new(SessionManager::new(
            service,
            registry,
            SessionDefaults::default(),
        ));
        (manager, agent_id)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(agent_id, Uuid::new_v4(), Some(json!({"platform": "test"})), None)
            .await
            .unwrap();

        let fetched = manager.get(created.session_id).unwrap();
        assert_eq!(fetched.session_id, created.session_id);
        assert_eq!(fetched.channel_id, created.channel_id);
        assert_eq!(fetched.renewal_count, 0);
        assert!(fetched.time_remaining > 0);

        // The backing channel is a DM with both participants.
        let participants = manager
            .service
            .list_participants(created.channel_id)
            .unwrap();
        assert_eq!(participants.len(), 2);
    }

    #[tokio::test]
    async fn create_rejects_unknown_agent() {
        let (manager, _agent) = manager().await;
        let err = manager
            .create(Uuid::new_v4(), Uuid::new_v4(), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AgentNotFound);
    }

    #[tokio::test]
    async fn expired_session_gone_then_not_found() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        manager.with_session_mut(created.session_id, |s| {
            s.expires_at = Utc::now() - Duration::minutes(1);
        });

        let err = manager.get(created.session_id).unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionExpired);

        let err = manager.get(created.session_id).unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn heartbeat_on_expired_session_is_gone() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(
                agent_id,
                Uuid::new_v4(),
                None,
                Some(TimeoutConfigPatch {
                    timeout_minutes: Some(json!(5)),
                    auto_renew: Some(false),
                    ..TimeoutConfigPatch::default()
                }),
            )
            .await
            .unwrap();

        // Advance the clock six minutes past creation.
        manager.with_session_mut(created.session_id, |s| {
            s.created_at -= Duration::minutes(6);
            s.last_activity = s.created_at;
            s.expires_at = compute_expiry(s.created_at, s.last_activity, &s.timeout_config);
        });

        let err = manager.heartbeat(created.session_id).unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionExpired);
        let err = manager.get(created.session_id).unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn heartbeat_without_auto_renew_keeps_expiry() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(
                agent_id,
                Uuid::new_v4(),
                None,
                Some(TimeoutConfigPatch {
                    auto_renew: Some(false),
                    ..TimeoutConfigPatch::default()
                }),
            )
            .await
            .unwrap();

        let before = manager.get(created.session_id).unwrap();
        let after = manager.heartbeat(created.session_id).unwrap();

        assert_eq!(after.expires_at, before.expires_at);
        assert!(after.last_activity >= before.last_activity);
        assert_eq!(after.renewal_count, 0);
    }

    #[tokio::test]
    async fn heartbeat_with_auto_renew_extends() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        manager.with_session_mut(created.session_id, |s| {
            s.last_activity -= Duration::minutes(10);
            s.expires_at = compute_expiry(s.created_at, s.last_activity, &s.timeout_config);
        });
        let stale = manager.get(created.session_id).unwrap();

        let renewed = manager.heartbeat(created.session_id).unwrap();
        assert!(renewed.expires_at > stale.expires_at);
        assert_eq!(renewed.renewal_count, stale.renewal_count + 1);
    }

    #[tokio::test]
    async fn manual_renew_ignores_auto_renew_flag() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(
                agent_id,
                Uuid::new_v4(),
                None,
                Some(TimeoutConfigPatch {
                    auto_renew: Some(false),
                    ..TimeoutConfigPatch::default()
                }),
            )
            .await
            .unwrap();

        let renewed = manager.renew(created.session_id).unwrap();
        assert_eq!(renewed.renewal_count, 1);
    }

    #[tokio::test]
    async fn renew_fails_past_max_duration() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        manager.with_session_mut(created.session_id, |s| {
            let lived = Duration::minutes(s.timeout_config.max_duration_minutes + 1);
            s.created_at -= lived;
            // Keep it unexpired so the renewal path itself is exercised.
            s.expires_at = Utc::now() + Duration::minutes(1);
        });

        let err = manager.renew(created.session_id).unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionRenewalFailed);
    }

    #[tokio::test]
    async fn renewal_count_is_monotonic() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        let mut last = 0;
        for _ in 0..3 {
            let view = manager.renew(created.session_id).unwrap();
            assert!(view.renewal_count > last);
            last = view.renewal_count;
        }
    }

    #[tokio::test]
    async fn send_message_stamps_session_id_and_reports_status() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        let sent = manager
            .send_message(
                created.session_id,
                "hello agent".to_string(),
                None,
                Some(json!({"clientVersion": "1.0"})),
            )
            .await
            .unwrap();

        assert_eq!(sent.channel_id, created.channel_id);
        assert!(sent.status.was_renewed);
        let metadata = sent.message.metadata.unwrap();
        assert_eq!(metadata["sessionId"], created.session_id.to_string());
        assert_eq!(metadata["clientVersion"], "1.0");
    }

    #[tokio::test]
    async fn send_message_rejects_oversized_content() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        let long = "x".repeat(crate::validate::MAX_CONTENT_LENGTH + 1);
        let err = manager
            .send_message(created.session_id, long, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ContentTooLarge);
    }

    #[tokio::test]
    async fn message_pagination_with_after_filter() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        for i in 0..4 {
            manager
                .send_message(created.session_id, format!("m{i}"), None, None)
                .await
                .unwrap();
        }

        let page = manager
            .get_messages(created.session_id, Some(2), None, None)
            .unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(page.has_more);
        assert!(page.cursors.before.is_some());

        let far_future = Utc::now() + Duration::minutes(5);
        let empty = manager
            .get_messages(created.session_id, None, None, Some(far_future))
            .unwrap();
        assert!(empty.messages.is_empty());
        assert!(!empty.has_more);
    }

    #[tokio::test]
    async fn update_timeout_recomputes_expiry() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        let updated = manager
            .update_timeout(
                created.session_id,
                &TimeoutConfigPatch {
                    timeout_minutes: Some(json!(120)),
                    ..TimeoutConfigPatch::default()
                },
            )
            .unwrap();
        assert_eq!(updated.timeout_config.timeout_minutes, 120);
        assert!(updated.expires_at > created.expires_at);

        let err = manager
            .update_timeout(created.session_id, &TimeoutConfigPatch::default())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTimeoutConfig);
    }

    #[tokio::test]
    async fn delete_then_get_not_found() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        manager.delete(created.session_id).unwrap();
        let err = manager.get(created.session_id).unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotFound);

        // Channel outlives the session.
        assert!(manager.service.get_channel(created.channel_id).is_ok());
    }

    #[tokio::test]
    async fn sweep_removes_expired_and_marks_warnings() {
        let (manager, agent_id) = manager().await;
        let expired = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();
        let warned = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        manager.with_session_mut(expired.session_id, |s| {
            s.expires_at = Utc::now() - Duration::minutes(1);
        });
        manager.with_session_mut(warned.session_id, |s| {
            s.expires_at = Utc::now() + Duration::minutes(2);
        });

        let (swept, malformed) = manager.sweep();
        assert_eq!(swept, 1);
        assert_eq!(malformed, 0);

        let view = manager.get(warned.session_id).unwrap();
        assert!(view.warning_state.is_some_and(|w| w.sent));
        assert!(view.is_near_expiration);
    }

    #[tokio::test]
    async fn renewal_clears_warning_state() {
        let (manager, agent_id) = manager().await;
        let created = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        manager.with_session_mut(created.session_id, |s| {
            s.expires_at = Utc::now() + Duration::minutes(2);
        });
        manager.sweep();
        assert!(manager
            .get(created.session_id)
            .unwrap()
            .warning_state
            .is_some());

        let renewed = manager.renew(created.session_id).unwrap();
        assert!(renewed.warning_state.is_none());
    }

    #[tokio::test]
    async fn health_counts() {
        let (manager, agent_id) = manager().await;
        manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        let health = manager.health();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["activeSessions"], 1);
        assert_eq!(health["invalidSessions"], 0);
    }

    #[tokio::test]
    async fn agent_timeout_cache_feeds_merge() {
        let (manager, agent_id) = manager().await;
        manager.cache_agent_timeout(
            agent_id,
            TimeoutConfig {
                timeout_minutes: 90,
                auto_renew: false,
                max_duration_minutes: 360,
                warning_threshold_minutes: 15,
            },
        );

        let created = manager
            .create(agent_id, Uuid::new_v4(), None, None)
            .await
            .unwrap();
        assert_eq!(created.timeout_config.timeout_minutes, 90);
        assert!(!created.timeout_config.auto_renew);
    }
}
