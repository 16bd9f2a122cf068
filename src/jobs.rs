//! One-off message jobs: an ephemeral DM, one user message, one expected
//! agent reply.
//!
//! Jobs are router-local state. A bus listener completes the job on the
//! first real agent message in its channel; intermediate
//! `Executing action:` messages are tolerated. Sweeps bound both job
//! lifetime and memory.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{MessageBus, SubscriptionId, Topic};
use crate::db::{ChannelType, NewChannel};
use crate::error::{ApiError, ErrorCode};
use crate::messages::{MessageService, PostMessage};
use crate::runtime::RuntimeRegistry;
use crate::validate::{self, clamp_i64};

pub const MIN_TIMEOUT_MS: i64 = 5_000;
pub const MAX_TIMEOUT_MS: i64 = 300_000;
pub const DEFAULT_TIMEOUT_MS: i64 = 60_000;

/// Listener cleanup cap, independent of any user-supplied timeout.
pub const ABSOLUTE_MAX_LISTENER_TIMEOUT_MS: i64 = 600_000;

pub const MAX_JOBS_IN_MEMORY: usize = 1_000;

/// How long terminal jobs stay queryable before the sweep evicts them.
const TERMINAL_RETENTION_MS: i64 = 300_000;

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Agent progress messages that must not complete the job.
const ACTION_PREFIX: &str = "Executing action:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub channel_id: Uuid,
    pub content: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub metadata: Value,
    pub user_message_id: Option<Uuid>,
    pub agent_response_id: Option<Uuid>,
    action_message_received: bool,
}

impl Job {
    fn view(&self) -> JobView {
        JobView {
            id: self.id,
            agent_id: self.agent_id,
            user_id: self.user_id,
            channel_id: self.channel_id,
            content: self.content.clone(),
            status: self.status,
            created_at: self.created_at,
            expires_at: self.expires_at,
            result: self.result.clone(),
            error: self.error.clone(),
            metadata: self.metadata.clone(),
            user_message_id: self.user_message_id,
            agent_response_id: self.agent_response_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub channel_id: Uuid,
    pub content: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_response_id: Option<Uuid>,
}

pub struct JobManager {
    jobs: Mutex<HashMap<Uuid, Job>>,
    service: Arc<MessageService>,
    bus: Arc<MessageBus>,
    registry: Arc<RuntimeRegistry>,
    listeners: Mutex<HashMap<Uuid, SubscriptionId>>,
    listener_timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl JobManager {
    pub fn new(
        service: Arc<MessageService>,
        bus: Arc<MessageBus>,
        registry: Arc<RuntimeRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            service,
            bus,
            registry,
            listeners: Mutex::new(HashMap::new()),
            listener_timers: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            started_at: Instant::now(),
        })
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create a job: ephemeral DM channel, persisted user message, bus
    /// listener for the reply.
    pub async fn create(
        self: &Arc<Self>,
        agent_id: Uuid,
        user_id: Uuid,
        content: String,
        timeout_ms: Option<Value>,
        metadata: Option<Value>,
    ) -> Result<JobView, ApiError> {
        validate::validate_content(&content)?;
        validate::validate_metadata(metadata.as_ref())?;
        if !self.registry.contains(agent_id).await {
            return Err(ApiError::new(
                ErrorCode::AgentNotFound,
                format!("agent {agent_id} is not available"),
            ));
        }

        let timeout = clamp_i64(
            "timeoutMs",
            timeout_ms.as_ref(),
            DEFAULT_TIMEOUT_MS,
            MIN_TIMEOUT_MS,
            MAX_TIMEOUT_MS,
        );

        let job_id = Uuid::new_v4();
        let now = Utc::now();
        let id_prefix: String = job_id.to_string().chars().take(8).collect();

        let channel = self
            .service
            .store()
            .create_channel(&NewChannel {
                id: None,
                message_server_id: self.service.current_server_id(),
                name: format!("Job {id_prefix}"),
                channel_type: ChannelType::Dm,
                source_type: Some("job".to_string()),
                topic: None,
                metadata: Some(json!({ "jobId": job_id.to_string(), "ephemeral": true })),
                participants: vec![user_id, agent_id],
            })
            .map_err(|err| {
                tracing::error!(error = %err, "failed to create job channel");
                ApiError::new(ErrorCode::ChannelCreationFailed, "could not create job channel")
            })?;

        let job = Job {
            id: job_id,
            agent_id,
            user_id,
            channel_id: channel.id,
            content: content.clone(),
            status: JobStatus::Pending,
            created_at: now,
            expires_at: now + Duration::milliseconds(timeout),
            finished_at: None,
            result: None,
            error: None,
            metadata: metadata.unwrap_or_else(|| json!({})),
            user_message_id: None,
            agent_response_id: None,
            action_message_received: false,
        };

        {
            let mut jobs = self.locked();
            if jobs.len() >= MAX_JOBS_IN_MEMORY {
                emergency_evict(&mut jobs);
            }
            jobs.insert(job_id, job);
        }

        self.attach_listener(job_id, channel.id, agent_id).await;
        self.arm_listener_timer(job_id, timeout);

        // Persist the user message; the bus fanout wakes the agent.
        let message = self
            .service
            .post_message(PostMessage {
                channel_id: channel.id,
                author_id: user_id,
                message_server_id: self.service.current_server_id(),
                content,
                in_reply_to_message_id: None,
                raw_message: None,
                metadata: Some(json!({ "jobId": job_id.to_string() })),
                source_type: Some("job_request".to_string()),
                source_id: None,
                author_display_name: None,
            })
            .await;

        let view = {
            let mut jobs = self.locked();
            let Some(job) = jobs.get_mut(&job_id) else {
                return Err(ApiError::new(ErrorCode::JobNotFound, "job evicted during creation"));
            };
            match message {
                Ok(message) => {
                    job.status = JobStatus::Processing;
                    job.user_message_id = Some(message.id);
                }
                Err(err) => {
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(Utc::now());
                    job.error = Some(err.message.clone());
                    tracing::error!(job_id = %job_id, error = %err, "job user message failed");
                }
            }
            job.view()
        };

        if view.status == JobStatus::Failed {
            self.detach_listener(view.id).await;
        }
        Ok(view)
    }

    pub fn get(&self, job_id: Uuid) -> Result<JobView, ApiError> {
        self.locked()
            .get(&job_id)
            .map(Job::view)
            .ok_or_else(|| ApiError::new(ErrorCode::JobNotFound, format!("job {job_id} not found")))
    }

    pub fn list(&self) -> Vec<JobView> {
        let mut views: Vec<JobView> = self.locked().values().map(Job::view).collect();
        views.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        views
    }

    pub fn health(&self) -> Value {
        let jobs = self.locked();
        let processing = jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .count();
        let terminal = jobs.values().filter(|j| j.status.is_terminal()).count();
        json!({
            "status": "healthy",
            "totalJobs": jobs.len(),
            "processing": processing,
            "terminal": terminal,
            "timestamp": Utc::now().to_rfc3339(),
            "uptime": self.started_at.elapsed().as_secs(),
        })
    }

    /// Listener for agent messages on the job channel. Held by a weak
    /// reference so a dropped manager never lingers inside the bus.
    async fn attach_listener(self: &Arc<Self>, job_id: Uuid, channel_id: Uuid, agent_id: Uuid) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let subscription = self
            .bus
            .subscribe(Topic::NewMessage, move |payload| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(manager) = weak.upgrade() else {
                        return Ok(());
                    };
                    manager.on_channel_message(job_id, channel_id, agent_id, &payload);
                    Ok(())
                })
            })
            .await;

        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(job_id, subscription);
        }
    }

    fn on_channel_message(&self, job_id: Uuid, channel_id: Uuid, agent_id: Uuid, payload: &Value) {
        let on_channel = payload
            .get("channel_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::try_parse(s).ok())
            == Some(channel_id);
        let from_agent = payload
            .get("author_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::try_parse(s).ok())
            == Some(agent_id);
        if !on_channel || !from_agent {
            return;
        }

        let content = payload
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message_id = payload
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::try_parse(s).ok());

        let mut jobs = self.locked();
        let Some(job) = jobs.get_mut(&job_id) else {
            return;
        };
        if job.status != JobStatus::Processing {
            return;
        }

        if content.trim_start().starts_with(ACTION_PREFIX) {
            job.action_message_received = true;
            tracing::debug!(job_id = %job_id, "job saw intermediate action message");
            return;
        }

        job.status = JobStatus::Completed;
        job.finished_at = Some(Utc::now());
        job.agent_response_id = message_id;
        job.result = Some(json!({
            "message": {
                "id": message_id.map(|id| id.to_string()),
                "content": content,
            },
            "sawActionMessage": job.action_message_received,
        }));
        tracing::info!(job_id = %job_id, "job completed");
    }

    /// Cap listener lifetime independent of the request's timeout value.
    fn arm_listener_timer(self: &Arc<Self>, job_id: Uuid, timeout_ms: i64) {
        let weak = Arc::downgrade(self);
        let bound = timeout_ms
            .saturating_add(MIN_TIMEOUT_MS)
            .min(ABSOLUTE_MAX_LISTENER_TIMEOUT_MS);
        #[allow(clippy::cast_sign_loss)]
        let delay = std::time::Duration::from_millis(bound as u64);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.detach_listener(job_id).await;
            }
        });
        if let Ok(mut timers) = self.listener_timers.lock() {
            timers.insert(job_id, handle);
        }
    }

    async fn detach_listener(&self, job_id: Uuid) {
        let subscription = self
            .listeners
            .lock()
            .ok()
            .and_then(|mut listeners| listeners.remove(&job_id));
        if let Some(id) = subscription {
            self.bus.unsubscribe(Topic::NewMessage, id).await;
        }
        if let Ok(mut timers) = self.listener_timers.lock() {
            if let Some(handle) = timers.remove(&job_id) {
                handle.abort();
            }
        }
    }

    /// One sweep pass: time out overdue jobs, evict terminal jobs past
    /// retention. Returns the set of jobs whose listeners must detach.
    fn sweep_pass(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let mut to_detach = Vec::new();
        let mut jobs = self.locked();

        for job in jobs.values_mut() {
            if !job.status.is_terminal() && now >= job.expires_at {
                job.status = JobStatus::Timeout;
                job.finished_at = Some(now);
                job.error = Some(
                    crate::error::ApiError::new(
                        crate::error::ErrorCode::JobTimeout,
                        "job timed out waiting for an agent response",
                    )
                    .to_string(),
                );
                to_detach.push(job.id);
                tracing::warn!(job_id = %job.id, "job timed out");
            }
        }

        let retention = Duration::milliseconds(TERMINAL_RETENTION_MS);
        jobs.retain(|_, job| {
            let evict = job.status.is_terminal()
                && job
                    .finished_at
                    .is_some_and(|finished| now - finished > retention);
            !evict
        });

        if jobs.len() > MAX_JOBS_IN_MEMORY {
            emergency_evict(&mut jobs);
        }

        to_detach
    }

    pub async fn sweep(&self) {
        let to_detach = self.sweep_pass();
        for job_id in to_detach {
            self.detach_listener(job_id).await;
        }
    }

    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sweep().await;
            }
        });
        if let Ok(mut sweeper) = self.sweeper.lock() {
            *sweeper = Some(handle);
        }
    }

    pub async fn cleanup(&self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
        let job_ids: Vec<Uuid> = self
            .listeners
            .lock()
            .map(|listeners| listeners.keys().copied().collect())
            .unwrap_or_default();
        for job_id in job_ids {
            self.detach_listener(job_id).await;
        }
        self.locked().clear();
    }

    #[cfg(test)]
    fn with_job_mut(&self, job_id: Uuid, f: impl FnOnce(&mut Job)) {
        let mut jobs = self.locked();
        if let Some(job) = jobs.get_mut(&job_id) {
            f(job);
        }
    }
}

/// Trim the oldest tenth when the map outgrows its cap.
fn emergency_evict(jobs: &mut HashMap<Uuid, Job>) {
    let evict_count = (jobs.len() / 10).max(1);
    let mut by_age: Vec<(Uuid, DateTime<Utc>)> =
        jobs.iter().map(|(id, job)| (*id, job.created_at)).collect();
    by_age.sort_by_key(|(_, created)| *created);
    for (id, _) in by_age.into_iter().take(evict_count) {
        jobs.remove(&id);
    }
    tracing::warn!(evicted = evict_count, "emergency job eviction");
}
