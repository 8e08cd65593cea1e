//! Error taxonomy for queue operations.
//!
//! All infrastructure failures are variants of [`QueueError`]; handler
//! outcomes are encoded separately as [`HandlerError`] values so the worker
//! harness can route on them without downcasting.

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Primary error type for control-plane operations.
///
/// Variants map onto the error handling used by the consumer harness:
/// validation failures are terminal and never retried, broker errors are
/// surfaced to the caller (or nacked with requeue inside the harness),
/// database errors on the idempotency/poison path fail open, and audit
/// errors never fail the data plane. Duplicate and quarantine outcomes are
/// lifecycle decisions, not errors, and are routed through the store
/// results rather than this type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// Malformed envelope; never retried.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Publish/consume infrastructure failure.
    #[error("Broker error: {message}")]
    Broker { message: String },

    /// Idempotency/poison/audit backend failure.
    #[error("Database error: {message}")]
    Database { message: String },

    /// Audit pipeline failure; best-effort, never stalls the data plane.
    #[error("Audit backend error: {message}")]
    AuditBackend { message: String },

    /// Publisher admission denied by the per-org token bucket.
    #[error("Rate limited: org {org_id}")]
    RateLimited { org_id: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        QueueError::Serialization {
            message: error.to_string(),
        }
    }
}

/// Outcome of a message handler, as a value rather than control flow.
///
/// `Transient` feeds the retry scheduler; `Fatal` routes straight to the
/// dead-letter queue.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("Transient handler error: {message}")]
    Transient { message: String },

    #[error("Fatal handler error: {message}")]
    Fatal { message: String },
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal {
            message: message.into(),
        }
    }

    /// Whether the failure should be fed to the retry scheduler.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient { .. })
    }

    /// Stable error-kind label used in response payloads and DLQ rows.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Transient { .. } => "TransientHandlerError",
            HandlerError::Fatal { .. } => "FatalHandlerError",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Transient { message } | HandlerError::Fatal { message } => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_retryability() {
        assert!(HandlerError::transient("upstream 503").is_retryable());
        assert!(!HandlerError::fatal("unknown message type").is_retryable());
    }

    #[test]
    fn test_handler_error_kinds() {
        assert_eq!(
            HandlerError::transient("x").kind(),
            "TransientHandlerError"
        );
        assert_eq!(HandlerError::fatal("x").kind(), "FatalHandlerError");
    }

    #[test]
    fn test_serde_json_error_maps_to_serialization() {
        let err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let queue_err: QueueError = err.into();
        assert!(matches!(queue_err, QueueError::Serialization { .. }));
    }
}
