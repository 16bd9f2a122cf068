//! Outbound client the agent connector uses to submit replies to the
//! central message service.
//!
//! Egress is restricted to localhost variants: the connector runs in the
//! same process group as the central service and must never be pointed at
//! an arbitrary host by configuration alone.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A reply on its way back to the central store.
#[derive(Debug, Clone)]
pub struct ReplySubmission {
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub server_id: Uuid,
    pub content: String,
    pub in_reply_to_message_id: Option<Uuid>,
    pub metadata: Option<Value>,
}

/// Where the connector posts agent replies. Trait-seamed so tests can
/// record submissions without a network.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn submit_reply(&self, reply: ReplySubmission) -> Result<(), String>;
}

pub struct CentralClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl CentralClient {
    /// Build a client for the given base URL. Non-localhost URLs are
    /// rejected outright.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, String> {
        if !is_localhost_url(base_url) {
            return Err(format!(
                "central message server URL must be a localhost variant, got {base_url}"
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(SUBMIT_TIMEOUT)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }
}

#[async_trait]
impl ReplySink for CentralClient {
    async fn submit_reply(&self, reply: ReplySubmission) -> Result<(), String> {
        let url = format!(
            "{}/api/channels/{}/messages",
            self.base_url, reply.channel_id
        );
        let mut body = json!({
            "author_id": reply.author_id.to_string(),
            "content": reply.content,
            "message_server_id": reply.server_id.to_string(),
            "source_type": "agent_response",
            "transport": "websocket",
        });
        if let Some(in_reply_to) = reply.in_reply_to_message_id {
            body["in_reply_to_message_id"] = Value::String(in_reply_to.to_string());
        }
        if let Some(metadata) = reply.metadata {
            body["metadata"] = metadata;
        }

        let mut request = self.http.post(&url).json(&body);
        if let Some(token) = &self.auth_token {
            request = request.header("X-API-KEY", token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("central submit failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "central service rejected reply: {}",
                response.status()
            ));
        }
        Ok(())
    }
}

/// Only loopback-style hosts pass.
fn is_localhost_url(raw: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(raw) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    matches!(
        url.host_str(),
        Some("localhost" | "127.0.0.1" | "0.0.0.0" | "[::1]" | "::1")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_variants_pass() {
        for url in [
            "http://localhost:3000",
            "http://127.0.0.1:3000",
            "http://0.0.0.0:8080",
            "https://localhost",
        ] {
            assert!(is_localhost_url(url), "should accept {url}");
        }
    }

    #[test]
    fn remote_hosts_fail() {
        for url in [
            "http://example.com",
            "http://10.0.0.5:3000",
            "ftp://localhost",
            "not a url",
        ] {
            assert!(!is_localhost_url(url), "should reject {url}");
        }
    }

    #[test]
    fn client_rejects_remote_base() {
        assert!(CentralClient::new("http://evil.example", None).is_err());
        assert!(CentralClient::new("http://localhost:3000", None).is_ok());
    }
}
