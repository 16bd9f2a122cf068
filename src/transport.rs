//! Transport dispatcher: one entry, three exits.
//!
//! `sync` waits for the full agent response, `stream` emits server-sent
//! events, `socket` acknowledges immediately and lets the bus fanout do the
//! rest.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::db::Message;
use crate::error::{ApiError, ErrorCode};
use crate::runtime::{AgentInput, AgentReply, AgentResponse, AgentRuntime, RuntimeRegistry};

/// Deadline for a synchronous agent call.
const SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Client-facing message-return shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Sse,
    Websocket,
}

pub const ACCEPTED_TRANSPORTS: [&str; 3] = ["http", "sse", "websocket"];
pub const LEGACY_TRANSPORTS: [&str; 3] = ["sync", "stream", "websocket"];

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Sse => "sse",
            Self::Websocket => "websocket",
        }
    }

    /// Parse a transport tag. Accepts the canonical names plus the legacy
    /// aliases (`sync`, `stream`). Absent and empty input both default to
    /// `websocket`.
    pub fn parse(raw: Option<&str>) -> Result<Self, ApiError> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::Websocket),
            Some("http") | Some("sync") => Ok(Self::Http),
            Some("sse") | Some("stream") => Ok(Self::Sse),
            Some("websocket") => Ok(Self::Websocket),
            Some(other) => Err(ApiError::with_details(
                ErrorCode::InvalidTransport,
                format!("unknown transport '{other}'"),
                json!({
                    "accepted": ACCEPTED_TRANSPORTS,
                    "legacyAliases": LEGACY_TRANSPORTS,
                }),
            )),
        }
    }
}

/// Route a persisted user message out through the requested transport.
///
/// `extra` is merged into the sync/socket response envelope (session status
/// and similar). For `Websocket` the response returns immediately; the bus
/// publication already happened when the message was persisted.
pub async fn dispatch(
    transport: Transport,
    registry: &Arc<RuntimeRegistry>,
    agent_id: Uuid,
    user_message: &Message,
    input: AgentInput,
    extra: Option<Value>,
) -> Response {
    tracing::debug!(
        transport = transport.as_str(),
        agent_id = %agent_id,
        message_id = %user_message.id,
        "dispatching user message"
    );
    match transport {
        Transport::Http => {
            let Some(runtime) = registry.get(agent_id).await else {
                return agent_missing(agent_id).into_response();
            };
            match collect_sync_response(runtime, input).await {
                Ok(response) => {
                    let body = success_envelope(user_message, Some(&response), extra);
                    (StatusCode::CREATED, Json(body)).into_response()
                }
                Err(err) => err.into_response(),
            }
        }
        Transport::Sse => {
            let Some(runtime) = registry.get(agent_id).await else {
                return agent_missing(agent_id).into_response();
            };
            let user_json = serde_json::to_value(user_message).unwrap_or(Value::Null);
            let frames = spawn_sse_feed(runtime, input, user_json);
            let stream = ReceiverStream::new(frames)
                .map(|(name, data)| Ok::<_, std::convert::Infallible>(sse_event(&name, &data)));
            let mut response = Sse::new(stream)
                .keep_alive(
                    KeepAlive::new()
                        .interval(Duration::from_secs(15))
                        .text("ping"),
                )
                .into_response();
            let headers = response.headers_mut();
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            response
        }
        Transport::Websocket => {
            let body = success_envelope(user_message, None, extra);
            (StatusCode::CREATED, Json(body)).into_response()
        }
    }
}

fn agent_missing(agent_id: Uuid) -> ApiError {
    ApiError::new(
        ErrorCode::AgentNotFound,
        format!("agent {agent_id} is not running here"),
    )
}

/// Invoke the runtime and wait for its final response, bounded by the
/// request deadline.
async fn collect_sync_response(
    runtime: Arc<dyn AgentRuntime>,
    input: AgentInput,
) -> Result<AgentResponse, ApiError> {
    let (tx, mut rx) = mpsc::channel::<AgentReply>(64);
    let worker = tokio::spawn(async move { runtime.handle_message(input, tx).await });

    let collected = tokio::time::timeout(SYNC_TIMEOUT, async {
        while let Some(reply) = rx.recv().await {
            match reply {
                AgentReply::Chunk { .. } => {}
                AgentReply::Complete { response } => return Ok(response),
                AgentReply::Error { message } => {
                    return Err(ApiError::new(ErrorCode::RuntimeError, message));
                }
            }
        }
        Err(ApiError::new(
            ErrorCode::RuntimeError,
            "agent ended without a response",
        ))
    })
    .await;

    match collected {
        Ok(result) => result,
        Err(_) => {
            worker.abort();
            Err(ApiError::new(
                ErrorCode::UpstreamTimeout,
                "agent did not respond within the request deadline",
            ))
        }
    }
}

/// Feed the SSE event sequence: `user_message`, `chunk`* (with increasing
/// `index`), then `done` or `error`. The feed stops at the next send after
/// the client disconnects.
fn spawn_sse_feed(
    runtime: Arc<dyn AgentRuntime>,
    input: AgentInput,
    user_json: Value,
) -> mpsc::Receiver<(String, Value)> {
    let (frame_tx, frame_rx) = mpsc::channel::<(String, Value)>(64);

    tokio::spawn(async move {
        if frame_tx
            .send(("user_message".to_string(), json!({ "message": user_json })))
            .await
            .is_err()
        {
            return;
        }

        let (reply_tx, mut reply_rx) = mpsc::channel::<AgentReply>(64);
        let worker = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.handle_message(input, reply_tx).await })
        };

        let mut index: u64 = 0;
        let mut terminal_sent = false;
        while let Some(reply) = reply_rx.recv().await {
            let frame = match reply {
                AgentReply::Chunk { text, message_id } => {
                    let mut data = json!({ "chunk": text, "index": index });
                    if let Some(id) = message_id {
                        data["messageId"] = Value::String(id.to_string());
                    }
                    index += 1;
                    ("chunk".to_string(), data)
                }
                AgentReply::Complete { response } => {
                    terminal_sent = true;
                    (
                        "done".to_string(),
                        json!({
                            "text": response.text,
                            "actions": response.actions,
                        }),
                    )
                }
                AgentReply::Error { message } => {
                    terminal_sent = true;
                    ("error".to_string(), json!({ "error": message }))
                }
            };
            let is_terminal = terminal_sent;
            if frame_tx.send(frame).await.is_err() {
                // Client went away; abort the producer.
                worker.abort();
                return;
            }
            if is_terminal {
                break;
            }
        }

        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) if !terminal_sent => {
                let _ = frame_tx
                    .send(("error".to_string(), json!({ "error": err.to_string() })))
                    .await;
                terminal_sent = true;
            }
            Err(join_err) if !terminal_sent && !join_err.is_cancelled() => {
                let _ = frame_tx
                    .send(("error".to_string(), json!({ "error": "agent task failed" })))
                    .await;
                terminal_sent = true;
            }
            _ => {}
        }

        if !terminal_sent {
            let _ = frame_tx
                .send(("error".to_string(), json!({ "error": "agent ended without a response" })))
                .await;
        }
    });

    frame_rx
}

fn sse_event(name: &str, data: &Value) -> Event {
    Event::default().event(name).data(data.to_string())
}

/// Build the `{success:true, userMessage, agentResponse?, …extra}` body.
pub fn success_envelope(
    user_message: &Message,
    agent_response: Option<&AgentResponse>,
    extra: Option<Value>,
) -> Value {
    let mut body = json!({
        "success": true,
        "userMessage": serde_json::to_value(user_message).unwrap_or(Value::Null),
    });
    if let Some(response) = agent_response {
        body["agentResponse"] = json!({
            "text": response.text,
            "actions": response.actions,
            "metadata": response.metadata,
        });
    }
    if let Some(Value::Object(extra)) = extra {
        if let Some(map) = body.as_object_mut() {
            for (key, value) in extra {
                map.insert(key, value);
            }
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EchoRuntime;
    use chrono::Utc;
    use proptest::prelude::*;

    fn input(content: &str) -> AgentInput {
        AgentInput {
            entity_id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            world_id: None,
            content: content.to_string(),
            source: None,
            message_id: Some(Uuid::new_v4()),
            display_name: None,
            metadata: Value::Null,
        }
    }

    fn message() -> Message {
        Message {
            id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            content: "hi".to_string(),
            raw_message: None,
            source_type: Some("client_chat".to_string()),
            source_id: None,
            in_reply_to_root_message_id: None,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn parse_accepts_canonical_and_aliases() {
        assert_eq!(Transport::parse(Some("http")).unwrap(), Transport::Http);
        assert_eq!(Transport::parse(Some("sync")).unwrap(), Transport::Http);
        assert_eq!(Transport::parse(Some("sse")).unwrap(), Transport::Sse);
        assert_eq!(Transport::parse(Some("stream")).unwrap(), Transport::Sse);
        assert_eq!(
            Transport::parse(Some("websocket")).unwrap(),
            Transport::Websocket
        );
    }

    #[test]
    fn parse_defaults_empty_and_absent_to_websocket() {
        assert_eq!(Transport::parse(None).unwrap(), Transport::Websocket);
        assert_eq!(Transport::parse(Some("")).unwrap(), Transport::Websocket);
        assert_eq!(Transport::parse(Some("  ")).unwrap(), Transport::Websocket);
    }

    #[test]
    fn parse_rejects_unknown_with_accepted_list() {
        let err = Transport::parse(Some("carrier-pigeon")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransport);
        let details = err.details.unwrap();
        assert_eq!(details["accepted"][0], "http");
        assert_eq!(details["legacyAliases"][0], "sync");
    }

    proptest! {
        #[test]
        fn parse_never_panics(s in ".*") {
            let _ = Transport::parse(Some(&s));
        }
    }

    #[tokio::test]
    async fn sync_collects_full_response() {
        let runtime: Arc<dyn AgentRuntime> = Arc::new(EchoRuntime::new(Uuid::new_v4(), "echo"));
        let response = collect_sync_response(runtime, input("ping")).await.unwrap();
        assert_eq!(response.text, "You said: ping");
    }

    #[tokio::test]
    async fn sse_feed_orders_events_with_contiguous_indices() {
        let runtime: Arc<dyn AgentRuntime> = Arc::new(EchoRuntime::new(Uuid::new_v4(), "echo"));
        let mut frames = spawn_sse_feed(runtime, input("stream me"), json!({"id": "u1"}));

        let mut names = Vec::new();
        let mut indices = Vec::new();
        while let Some((name, data)) = frames.recv().await {
            if name == "chunk" {
                indices.push(data["index"].as_u64().unwrap());
            }
            names.push(name);
        }

        assert_eq!(names.first().map(String::as_str), Some("user_message"));
        assert_eq!(names.last().map(String::as_str), Some("done"));
        assert!(names.iter().filter(|n| n.as_str() == "chunk").count() >= 1);
        let expected: Vec<u64> = (0..indices.len() as u64).collect();
        assert_eq!(indices, expected);
    }

    #[tokio::test]
    async fn envelope_merges_extra_fields() {
        let body = success_envelope(
            &message(),
            Some(&AgentResponse {
                text: "pong".to_string(),
                actions: vec!["REPLY".to_string()],
                metadata: Value::Null,
            }),
            Some(json!({"sessionStatus": {"renewalCount": 2}})),
        );
        assert_eq!(body["success"], true);
        assert_eq!(body["agentResponse"]["text"], "pong");
        assert_eq!(body["sessionStatus"]["renewalCount"], 2);
        assert!(body["userMessage"]["id"].is_string());
    }

    #[tokio::test]
    async fn websocket_dispatch_returns_created_immediately() {
        let registry = Arc::new(RuntimeRegistry::new());
        let response = dispatch(
            Transport::Websocket,
            &registry,
            Uuid::new_v4(),
            &message(),
            input("fire and forget"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }
}
