//! Error taxonomy shared across the HTTP surface, socket router, and
//! internal services.
//!
//! Every `/api/*` failure renders as `{success:false, error:{code, message,
//! details?}}`. Socket handlers map the same codes into `messageError`
//! payloads; SSE streams surface them as a terminal `error` event.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

/// Machine-readable error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation
    InvalidId,
    MissingFields,
    InvalidContent,
    InvalidMetadata,
    InvalidPagination,
    InvalidTimeoutConfig,
    InvalidTransport,
    InvalidChannelId,
    InvalidContentType,
    // Authorization / isolation
    ForbiddenServerMismatch,
    AccessDeniedChannel,
    MissingApiKey,
    // Existence
    AgentNotFound,
    ChannelNotFound,
    MessageNotFound,
    SessionNotFound,
    JobNotFound,
    // Lifecycle
    SessionExpired,
    SessionRenewalFailed,
    SessionCreationError,
    MessageSendError,
    ChannelCreationFailed,
    JobTimeout,
    // Limits
    RateLimitExceeded,
    UploadRateLimitExceeded,
    FileRateLimitExceeded,
    ContentTooLarge,
    // Upstream
    UpstreamTimeout,
    PersistenceError,
    RuntimeError,
}

impl ErrorCode {
    /// HTTP status this code surfaces with.
    pub fn status(self) -> StatusCode {
        match self {
            Self::InvalidId
            | Self::MissingFields
            | Self::InvalidContent
            | Self::InvalidMetadata
            | Self::InvalidPagination
            | Self::InvalidTimeoutConfig
            | Self::InvalidTransport
            | Self::InvalidChannelId
            | Self::InvalidContentType => StatusCode::BAD_REQUEST,
            Self::MissingApiKey => StatusCode::UNAUTHORIZED,
            Self::ForbiddenServerMismatch | Self::AccessDeniedChannel => StatusCode::FORBIDDEN,
            Self::AgentNotFound
            | Self::ChannelNotFound
            | Self::MessageNotFound
            | Self::SessionNotFound
            | Self::JobNotFound => StatusCode::NOT_FOUND,
            Self::SessionExpired => StatusCode::GONE,
            Self::SessionRenewalFailed => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ContentTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimitExceeded
            | Self::UploadRateLimitExceeded
            | Self::FileRateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::SessionCreationError
            | Self::MessageSendError
            | Self::ChannelCreationFailed
            | Self::JobTimeout
            | Self::UpstreamTimeout
            | Self::PersistenceError
            | Self::RuntimeError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidId => "INVALID_ID",
            Self::MissingFields => "MISSING_FIELDS",
            Self::InvalidContent => "INVALID_CONTENT",
            Self::InvalidMetadata => "INVALID_METADATA",
            Self::InvalidPagination => "INVALID_PAGINATION",
            Self::InvalidTimeoutConfig => "INVALID_TIMEOUT_CONFIG",
            Self::InvalidTransport => "INVALID_TRANSPORT",
            Self::InvalidChannelId => "INVALID_CHANNEL_ID",
            Self::InvalidContentType => "INVALID_CONTENT_TYPE",
            Self::ForbiddenServerMismatch => "FORBIDDEN_SERVER_MISMATCH",
            Self::AccessDeniedChannel => "ACCESS_DENIED_CHANNEL",
            Self::MissingApiKey => "MISSING_API_KEY",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::ChannelNotFound => "CHANNEL_NOT_FOUND",
            Self::MessageNotFound => "MESSAGE_NOT_FOUND",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::SessionRenewalFailed => "SESSION_RENEWAL_FAILED",
            Self::SessionCreationError => "SESSION_CREATION_ERROR",
            Self::MessageSendError => "MESSAGE_SEND_ERROR",
            Self::ChannelCreationFailed => "CHANNEL_CREATION_FAILED",
            Self::JobTimeout => "JOB_TIMEOUT",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::UploadRateLimitExceeded => "UPLOAD_RATE_LIMIT_EXCEEDED",
            Self::FileRateLimitExceeded => "FILE_RATE_LIMIT_EXCEEDED",
            Self::ContentTooLarge => "CONTENT_TOO_LARGE",
            Self::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            Self::PersistenceError => "PERSISTENCE_ERROR",
            Self::RuntimeError => "RUNTIME_ERROR",
        }
    }
}

/// An error ready to be surfaced to a client.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    /// JSON body shared by HTTP responses and socket `messageError` frames.
    pub fn to_body(&self) -> Value {
        let mut error = json!({
            "code": self.code.as_str(),
            "message": self.message,
        });
        if let Some(details) = &self.details {
            error["details"] = details.clone();
        }
        json!({ "success": false, "error": error })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.code.status(), Json(self.to_body())).into_response()
    }
}

impl From<crate::db::StoreError> for ApiError {
    fn from(err: crate::db::StoreError) -> Self {
        match err {
            crate::db::StoreError::ChannelNotFound(id) => Self::new(
                ErrorCode::ChannelNotFound,
                format!("Channel {id} not found"),
            ),
            crate::db::StoreError::ServerNotFound(id) => Self::new(
                ErrorCode::PersistenceError,
                format!("Message server {id} not found"),
            ),
            crate::db::StoreError::MessageNotFound(id) => Self::new(
                ErrorCode::MessageNotFound,
                format!("Message {id} not found"),
            ),
            other => {
                tracing::error!(error = %other, "persistence failure");
                Self::new(ErrorCode::PersistenceError, "Storage operation failed")
            }
        }
    }
}
