//! Channel title generation using the agent runtime's text model.
//!
//! Produces short, meaningful titles from a chronological transcript.

use std::time::Duration;
use tokio::time::timeout;

use crate::db::Message;
use crate::runtime::AgentRuntime;

const TITLE_PROMPT: &str = "Generate a very short (3-6 words) title summarizing this conversation. \
Output only the title, no quotes or punctuation.\n\nConversation:";

const TITLE_TIMEOUT: Duration = Duration::from_secs(5);
const TITLE_TEMPERATURE: f32 = 0.2;
const TITLE_MAX_TOKENS: u32 = 50;
const MAX_TITLE_LENGTH: usize = 80;
const MAX_TRANSCRIPT_CHARS: usize = 2000;

/// Render messages, oldest first, as `Name: content` lines.
pub fn build_transcript(messages: &[Message]) -> String {
    let mut transcript = String::new();
    for message in messages {
        let name = message
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_display_name"))
            .and_then(serde_json::Value::as_str)
            .map_or_else(
                || message.author_id.to_string().chars().take(8).collect(),
                str::to_string,
            );
        transcript.push_str(&name);
        transcript.push_str(": ");
        transcript.push_str(&message.content);
        transcript.push('\n');
    }
    transcript
}

/// Generate a title for a channel transcript.
///
/// Returns `None` when generation fails (timeout, runtime error, empty
/// output); the caller decides the fallback.
pub async fn generate_title(runtime: &dyn AgentRuntime, transcript: &str) -> Option<String> {
    let truncated: String = transcript.chars().take(MAX_TRANSCRIPT_CHARS).collect();
    let prompt = format!("{TITLE_PROMPT}\n{truncated}");

    let result = timeout(
        TITLE_TIMEOUT,
        runtime.generate_text(&prompt, TITLE_TEMPERATURE, TITLE_MAX_TOKENS),
    )
    .await;

    match result {
        Ok(Ok(raw)) => {
            let title = tidy_title(&raw);
            if title.is_empty() {
                None
            } else {
                Some(title)
            }
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "title generation failed");
            None
        }
        Err(_) => {
            tracing::warn!("title generation timed out");
            None
        }
    }
}

/// Trim whitespace and enclosing quotes, collapse to a single line, and cap
/// the length at a word boundary when possible.
fn tidy_title(raw: &str) -> String {
    let line = raw.lines().next().unwrap_or("").trim();
    let unquoted = line
        .trim_matches(|c| matches!(c, '"' | '\'' | '\u{201c}' | '\u{201d}'))
        .trim();

    if unquoted.chars().count() <= MAX_TITLE_LENGTH {
        return unquoted.to_string();
    }

    let capped: String = unquoted.chars().take(MAX_TITLE_LENGTH).collect();
    match capped.rfind(' ') {
        Some(cut) => capped.split_at(cut).0.trim_end().to_string(),
        None => capped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EchoRuntime;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn message(content: &str, name: Option<&str>) -> Message {
        Message {
            id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            content: content.to_string(),
            raw_message: None,
            source_type: None,
            source_id: None,
            in_reply_to_root_message_id: None,
            metadata: name.map(|n| json!({"user_display_name": n})),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn transcript_uses_display_names() {
        let transcript = build_transcript(&[
            message("hi there", Some("Ada")),
            message("hello", None),
        ]);
        assert!(transcript.starts_with("Ada: hi there\n"));
        // Anonymous author falls back to an id prefix.
        assert_eq!(transcript.lines().count(), 2);
    }

    #[test]
    fn tidy_strips_quotes() {
        assert_eq!(tidy_title("\"Fixing Login Bug\""), "Fixing Login Bug");
        assert_eq!(tidy_title("'Planning sprint'\n"), "Planning sprint");
        assert_eq!(tidy_title("  Plain title  "), "Plain title");
    }

    #[test]
    fn tidy_caps_length() {
        let long = "word ".repeat(40);
        let title = tidy_title(&long);
        assert!(title.chars().count() <= MAX_TITLE_LENGTH);
    }

    #[tokio::test]
    async fn generates_from_runtime() {
        let runtime = EchoRuntime::new(Uuid::new_v4(), "echo");
        let title = generate_title(&runtime, "Ada: let us plan the launch\n").await;
        assert!(title.is_some());
        assert!(!title.unwrap().is_empty());
    }
}
