//! Message lifecycle states and audit event names.
//!
//! These values centralize naming so producers, workers, and the audit
//! pipeline stay consistent in the broker and in the database.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a message.
///
/// `QUEUED → PROCESSING → {COMPLETED, RETRYING, DEAD_LETTERED, DUPLICATE,
/// QUARANTINED}`; `RETRYING` re-enters `QUEUED` when its delay queue TTL
/// expires. Only the consumer holding the delivery tag may transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Retrying,
    DeadLettered,
    Duplicate,
    Quarantined,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "QUEUED",
            MessageStatus::Processing => "PROCESSING",
            MessageStatus::Completed => "COMPLETED",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Retrying => "RETRYING",
            MessageStatus::DeadLettered => "DEAD_LETTERED",
            MessageStatus::Duplicate => "DUPLICATE",
            MessageStatus::Quarantined => "QUARANTINED",
        }
    }

    /// Terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Completed
                | MessageStatus::DeadLettered
                | MessageStatus::Duplicate
                | MessageStatus::Quarantined
        )
    }
}

impl From<String> for MessageStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "QUEUED" => MessageStatus::Queued,
            "PROCESSING" => MessageStatus::Processing,
            "COMPLETED" => MessageStatus::Completed,
            "RETRYING" => MessageStatus::Retrying,
            "DEAD_LETTERED" => MessageStatus::DeadLettered,
            "DUPLICATE" => MessageStatus::Duplicate,
            "QUARANTINED" => MessageStatus::Quarantined,
            _ => MessageStatus::Failed,
        }
    }
}

impl From<MessageStatus> for String {
    fn from(status: MessageStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Audit event names emitted along the message lifecycle.
pub mod events {
    pub const CREATED: &str = "created";
    pub const ENQUEUED: &str = "enqueued";
    pub const PROMOTED: &str = "promoted";
    pub const DEQUEUED: &str = "dequeued";
    pub const PROCESSING: &str = "processing";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const RETRY_SCHEDULED: &str = "retry_scheduled";
    pub const DEAD_LETTER: &str = "dead_letter";
    pub const DUPLICATE_SKIPPED: &str = "duplicate_skipped";
    pub const POISON_QUARANTINED: &str = "poison_quarantined";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            MessageStatus::Queued,
            MessageStatus::Processing,
            MessageStatus::Completed,
            MessageStatus::Retrying,
            MessageStatus::DeadLettered,
            MessageStatus::Duplicate,
            MessageStatus::Quarantined,
        ] {
            let s: String = status.into();
            assert_eq!(MessageStatus::from(s), status);
        }
    }

    #[test]
    fn test_unknown_status_maps_to_failed() {
        assert_eq!(
            MessageStatus::from("SOMETHING_ELSE".to_string()),
            MessageStatus::Failed
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(MessageStatus::Completed.is_terminal());
        assert!(MessageStatus::DeadLettered.is_terminal());
        assert!(MessageStatus::Duplicate.is_terminal());
        assert!(MessageStatus::Quarantined.is_terminal());
        assert!(!MessageStatus::Queued.is_terminal());
        assert!(!MessageStatus::Processing.is_terminal());
        assert!(!MessageStatus::Retrying.is_terminal());
        assert!(!MessageStatus::Failed.is_terminal());
    }
}
