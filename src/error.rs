use std::fmt;

use thiserror::Error;

use crate::types::LogEntryId;

/// Errors surfaced by the relay pipeline.
///
/// Ingestion errors are returned to the sender synchronously and never
/// retried by the relay. Forward errors are recovered locally by the retry
/// policy and only become visible as dead-letter entries.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or empty input.
    #[error("{0}")]
    InvalidRequest(String),

    /// Ingestion was called with something other than the write method.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// Missing, invalid or platform-mismatched credential.
    #[error("{0}")]
    AuthenticationFailed(String),

    /// The durable log could not be reached or rejected the operation.
    #[error("log unavailable: {0}")]
    InfrastructureUnavailable(#[from] LogError),

    /// The local target did not accept the webhook.
    #[error("forward failed: {0}")]
    ForwardFailed(FailureReason),

    /// Retry budget exhausted.
    #[error("maximum retries exceeded after {retry_count} failed attempts")]
    MaxRetriesExceeded { retry_count: u32 },

    #[error("dead-letter entry not found: {0}")]
    DeadLetterNotFound(LogEntryId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RelayError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) | RelayError::MethodNotAllowed(_) => "INVALID_REQUEST",
            RelayError::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            RelayError::InfrastructureUnavailable(_) => "STREAM_ERROR",
            RelayError::ForwardFailed(_) => "WEBHOOK_FORWARD_ERROR",
            RelayError::MaxRetriesExceeded { .. } => "MAX_RETRIES_EXCEEDED",
            RelayError::DeadLetterNotFound(_) => "NOT_FOUND",
            RelayError::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }
}

/// Failures of the durable log primitives.
///
/// None of these are partial successes: the operation did not happen.
#[derive(Debug, Error)]
pub enum LogError {
    #[cfg(feature = "redis")]
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("record encoding: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("malformed entry {id}: {reason}")]
    MalformedEntry { id: LogEntryId, reason: String },

    #[error("consumer group {group} does not exist on {stream}")]
    MissingGroup { stream: String, group: String },
}

/// Reasons why a forwarding attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No response within the forward timeout.
    Timeout,

    /// Connection or protocol error before a response arrived.
    Network(String),

    /// The target answered outside the 2xx range.
    RemoteStatus(u16),

    /// The request could not be built (bad method, URL or header).
    InvalidRequest(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Network(detail) =>
                write!(f, "network error: {}", detail),
            FailureReason::RemoteStatus(status) =>
                write!(f, "target returned status {}", status),
            FailureReason::InvalidRequest(detail) =>
                write!(f, "invalid forward request: {}", detail),
        }
    }
}
