//! Error types for Grimoire operations.

use crate::registry::Readiness;
use chrono::{DateTime, Utc};

/// Failure reported by a remote generation backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Connection-level failures (DNS, refused, reset)
    #[error("network error: {0}")]
    Network(String),

    /// The outbound request timed out
    #[error("request timeout: {0}")]
    Timeout(String),

    /// The provider answered 429
    #[error("provider rate limit: {0}")]
    RateLimited(String),

    /// The provider answered with a 5xx status
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Missing or rejected credentials
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The provider rejected the request as malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Anything else the provider reported
    #[error("provider error: {0}")]
    Provider(String),
}

impl BackendError {
    /// Map an HTTP status and body into the matching variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Authentication(message),
            408 => Self::Timeout(message),
            429 => Self::RateLimited(message),
            500..=599 => Self::Server { status, message },
            400..=499 => Self::InvalidRequest(message),
            _ => Self::Provider(message),
        }
    }

    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Network(_)
                | BackendError::Timeout(_)
                | BackendError::RateLimited(_)
                | BackendError::Server { .. }
        )
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        if err.is_connect() || err.is_request() {
            return Self::Network(err.to_string());
        }
        Self::Provider(err.to_string())
    }
}

/// The main error type for Grimoire operations.
#[derive(Debug, thiserror::Error)]
pub enum GrimoireError {
    /// No conversation with this id
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// No model with this id is registered
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The model is registered but its prerequisites are missing
    #[error("Model not ready: {model} ({readiness})")]
    ModelNotReady { model: String, readiness: Readiness },

    /// Admission denied by a rate limiter
    #[error("Rate limit exceeded for {key} on {limiter}, resets at {reset_at}")]
    RateLimitExceeded {
        limiter: String,
        key: String,
        reset_at: DateTime<Utc>,
    },

    /// A local inference process exited unsuccessfully
    #[error("Process failed (exit code {exit_code:?}): {stderr_tail}")]
    ProcessFailed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    /// Process output could not be turned into a reply
    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    /// The call was cancelled or timed out
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Remote provider failure
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Every retry attempt failed
    #[error("Retry exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<GrimoireError>,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GrimoireError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a malformed output error
    pub fn malformed_output(msg: impl Into<String>) -> Self {
        Self::MalformedOutput(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Backend(BackendError::Provider(msg.into()))
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::Backend(BackendError::InvalidRequest(msg.into()))
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            GrimoireError::Backend(err) => err.is_transient(),
            GrimoireError::ProcessFailed { .. } => true,
            _ => false,
        }
    }

    /// Stable label used in error records and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            GrimoireError::ConversationNotFound(_) => "conversation_not_found",
            GrimoireError::ModelNotFound(_) => "model_not_found",
            GrimoireError::ModelNotReady { .. } => "model_not_ready",
            GrimoireError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GrimoireError::ProcessFailed { .. } => "process_failed",
            GrimoireError::MalformedOutput(_) => "malformed_output",
            GrimoireError::Cancelled(_) => "cancelled",
            GrimoireError::Backend(_) => "backend_error",
            GrimoireError::RetryExhausted { .. } => "retry_exhausted",
            GrimoireError::Configuration(_) => "configuration",
            GrimoireError::Serialization(_) => "serialization",
            GrimoireError::Io(_) => "io",
        }
    }
}
