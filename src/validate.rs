//! Input validation helpers: identifier parsing, channel-id gating,
//! clamp-and-default numeric parsing, and payload size bounds.

use crate::error::{ApiError, ErrorCode};
use serde_json::Value;
use uuid::Uuid;

/// Maximum message content length, in characters.
pub const MAX_CONTENT_LENGTH: usize = 4000;

/// Maximum serialized metadata size, in bytes.
pub const MAX_METADATA_BYTES: usize = 8192;

/// Characters never allowed in a channel identifier taken from a route
/// segment. Blocks path traversal and HTML injection before the UUID parse
/// even runs, so the rejection reason stays stable.
const FORBIDDEN_CHANNEL_CHARS: &[char] = &['/', '\\', '<', '>', '"', '\'', '&', '\0'];

/// Parse a canonical hex-dashed 128-bit identifier.
pub fn parse_id(field: &str, raw: &str) -> Result<Uuid, ApiError> {
    Uuid::try_parse(raw).map_err(|_| {
        ApiError::new(
            ErrorCode::InvalidId,
            format!("{field} must be a valid UUID"),
        )
    })
}

/// Validate a channel identifier from an untrusted path segment.
///
/// Rejects traversal/injection characters with `INVALID_CHANNEL_ID`, then
/// requires canonical UUID form.
pub fn parse_channel_id(raw: &str) -> Result<Uuid, ApiError> {
    if raw.is_empty() || raw.contains("..") || raw.chars().any(|c| FORBIDDEN_CHANNEL_CHARS.contains(&c)) {
        return Err(ApiError::new(
            ErrorCode::InvalidChannelId,
            "channelId contains forbidden characters",
        ));
    }
    Uuid::try_parse(raw).map_err(|_| {
        ApiError::new(
            ErrorCode::InvalidChannelId,
            "channelId must be a valid UUID",
        )
    })
}

/// Parse an optional identifier field, treating `None` and empty as absent.
pub fn parse_optional_id(field: &str, raw: Option<&str>) -> Result<Option<Uuid>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => parse_id(field, s).map(Some),
    }
}

/// Clamp-and-default integer parsing.
///
/// Accepts either a JSON number or a numeric string. Returns `default` when
/// the input is absent, non-numeric, non-finite, or empty; clamps into
/// `[min, max]` otherwise. Out-of-range and unparseable inputs log a
/// warning rather than erroring, so a sloppy client cannot wedge a session
/// with a NaN timeout.
pub fn clamp_i64(field: &str, raw: Option<&Value>, default: i64, min: i64, max: i64) -> i64 {
    let parsed = match raw {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                // f64 path catches JSON floats; NaN/inf cannot appear in
                // serde_json numbers but a lossy float still gets truncated.
                n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)
            }
        }
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<i64>().ok().or_else(|| {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f as i64)
                })
            }
        }
        Some(_) => None,
    };

    match parsed {
        None => {
            if raw.is_some_and(|v| !v.is_null()) {
                tracing::warn!(field, value = ?raw, default, "unparseable numeric input, using default");
            }
            default
        }
        Some(v) if v < min => {
            tracing::warn!(field, value = v, min, "numeric input below minimum, clamping");
            min
        }
        Some(v) if v > max => {
            tracing::warn!(field, value = v, max, "numeric input above maximum, clamping");
            max
        }
        Some(v) => v,
    }
}

/// Validate message content: non-empty after trimming, bounded length.
pub fn validate_content(content: &str) -> Result<(), ApiError> {
    if content.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::InvalidContent,
            "content must not be empty",
        ));
    }
    if content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(ApiError::new(
            ErrorCode::ContentTooLarge,
            format!("content exceeds {MAX_CONTENT_LENGTH} characters"),
        ));
    }
    Ok(())
}

/// Validate an opaque metadata map: must be an object (when present) and
/// bounded in serialized size.
pub fn validate_metadata(metadata: Option<&Value>) -> Result<(), ApiError> {
    let Some(value) = metadata else {
        return Ok(());
    };
    if value.is_null() {
        return Ok(());
    }
    if !value.is_object() {
        return Err(ApiError::new(
            ErrorCode::InvalidMetadata,
            "metadata must be an object",
        ));
    }
    let serialized = serde_json::to_string(value)
        .map_err(|_| ApiError::new(ErrorCode::InvalidMetadata, "metadata is not serializable"))?;
    if serialized.len() > MAX_METADATA_BYTES {
        return Err(ApiError::new(
            ErrorCode::InvalidMetadata,
            format!("metadata exceeds {MAX_METADATA_BYTES} bytes"),
        ));
    }
    Ok(())
}

/// Strip path separators and traversal sequences from an uploaded filename.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .replace("..", "");
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}
