//! Message envelope schema, validation, and dedup-key derivation.
//!
//! Validation is pure and idempotent: it performs no I/O, and a validated
//! envelope re-serialized and validated again yields the same envelope.
//! Envelopes that fail validation never enter the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueError;

/// Highest broker priority; envelopes carry 0..=9.
pub const MAX_PRIORITY: u8 = 9;

/// Default priority for envelopes that omit one.
pub const DEFAULT_PRIORITY: u8 = 2;

/// Originator of a message (producer service, agent, or system job).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedBy {
    #[serde(rename = "type")]
    pub actor_type: String,
    pub id: String,
}

/// Canonical message envelope; immutable after validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEnvelope {
    pub message_id: Uuid,
    pub version: String,
    pub org_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub created_by: CreatedBy,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    #[serde(default = "empty_map")]
    pub payload: Value,
    #[serde(default = "empty_map")]
    pub context: Value,
    #[serde(default = "empty_map")]
    pub metadata: Value,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

fn empty_map() -> Value {
    Value::Object(serde_json::Map::new())
}

impl MessageEnvelope {
    /// Validate a raw JSON message and produce the canonical envelope.
    ///
    /// Checks required fields, field types, the priority range, and the
    /// timestamp format. Returns [`QueueError::Validation`] for any
    /// malformed input.
    pub fn validate(raw: &Value) -> Result<Self, QueueError> {
        if !raw.is_object() {
            return Err(QueueError::Validation {
                message: "message must be a JSON object".to_string(),
            });
        }

        let envelope: MessageEnvelope =
            serde_json::from_value(raw.clone()).map_err(|e| QueueError::Validation {
                message: format!("invalid message envelope: {}", e),
            })?;

        envelope.check_invariants()?;
        Ok(envelope)
    }

    /// Field-level invariants that serde's shape checks cannot express.
    fn check_invariants(&self) -> Result<(), QueueError> {
        if self.org_id.trim().is_empty() {
            return Err(QueueError::Validation {
                message: "org_id must be non-empty".to_string(),
            });
        }
        if self.message_type.trim().is_empty() {
            return Err(QueueError::Validation {
                message: "type must be non-empty".to_string(),
            });
        }
        if self.priority > MAX_PRIORITY {
            return Err(QueueError::Validation {
                message: format!(
                    "priority {} out of range 0..={}",
                    self.priority, MAX_PRIORITY
                ),
            });
        }
        if !is_semver(&self.version) {
            return Err(QueueError::Validation {
                message: format!("version {:?} is not a semver string", self.version),
            });
        }
        if self.created_by.actor_type.trim().is_empty() || self.created_by.id.trim().is_empty() {
            return Err(QueueError::Validation {
                message: "created_by.type and created_by.id must be non-empty".to_string(),
            });
        }
        for (name, value) in [
            ("payload", &self.payload),
            ("context", &self.context),
            ("metadata", &self.metadata),
        ] {
            if !value.is_object() {
                return Err(QueueError::Validation {
                    message: format!("{} must be a JSON object", name),
                });
            }
        }
        if let Some(key) = &self.dedup_key {
            if key.trim().is_empty() {
                return Err(QueueError::Validation {
                    message: "dedup_key must be non-empty when present".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Logical identity used for idempotency; defaults to the message id.
    pub fn dedup_key(&self) -> String {
        self.dedup_key
            .clone()
            .unwrap_or_else(|| self.message_id.to_string())
    }

    /// Serialize for broker transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(self).map_err(QueueError::from)
    }

    /// Decode and re-validate a broker delivery body.
    pub fn from_bytes(body: &[u8]) -> Result<Self, QueueError> {
        let raw: Value = serde_json::from_slice(body).map_err(|e| QueueError::Validation {
            message: format!("message body is not valid JSON: {}", e),
        })?;
        Self::validate(&raw)
    }

    /// Trace context propagated through `x-trace-context` when present in
    /// the envelope metadata.
    pub fn trace_context(&self) -> Option<&str> {
        self.metadata.get("traceparent").and_then(Value::as_str)
    }
}

fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_message() -> Value {
        json!({
            "message_id": "7b0f4a9e-58a6-4b44-9e81-1f2f3a4b5c6d",
            "version": "1.0.0",
            "org_id": "demo-org",
            "type": "agent_message",
            "priority": 2,
            "created_by": {"type": "system", "id": "test"},
            "created_at": "2025-01-01T00:00:00Z",
        })
    }

    #[test]
    fn test_validate_accepts_minimal_message() {
        let envelope = MessageEnvelope::validate(&raw_message()).unwrap();
        assert_eq!(envelope.org_id, "demo-org");
        assert_eq!(envelope.priority, 2);
        assert!(envelope.payload.is_object());
        assert!(envelope.agent_id.is_none());
    }

    #[test]
    fn test_validate_defaults_priority() {
        let mut raw = raw_message();
        raw.as_object_mut().unwrap().remove("priority");
        let envelope = MessageEnvelope::validate(&raw).unwrap();
        assert_eq!(envelope.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn test_validate_rejects_priority_out_of_range() {
        let mut raw = raw_message();
        raw["priority"] = json!(10);
        assert!(matches!(
            MessageEnvelope::validate(&raw),
            Err(QueueError::Validation { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_missing_required_field() {
        let mut raw = raw_message();
        raw.as_object_mut().unwrap().remove("org_id");
        assert!(MessageEnvelope::validate(&raw).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_timestamp() {
        let mut raw = raw_message();
        raw["created_at"] = json!("not-a-timestamp");
        assert!(MessageEnvelope::validate(&raw).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_version() {
        let mut raw = raw_message();
        raw["version"] = json!("one.two");
        assert!(MessageEnvelope::validate(&raw).is_err());
    }

    #[test]
    fn test_validate_is_idempotent() {
        let first = MessageEnvelope::validate(&raw_message()).unwrap();
        let reserialized = serde_json::to_value(&first).unwrap();
        let second = MessageEnvelope::validate(&reserialized).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_dedup_key_defaults_to_message_id() {
        let envelope = MessageEnvelope::validate(&raw_message()).unwrap();
        assert_eq!(envelope.dedup_key(), envelope.message_id.to_string());

        let mut raw = raw_message();
        raw["dedup_key"] = json!("custom-key");
        let envelope = MessageEnvelope::validate(&raw).unwrap();
        assert_eq!(envelope.dedup_key(), "custom-key");
    }

    #[test]
    fn test_bytes_round_trip() {
        let envelope = MessageEnvelope::validate(&raw_message()).unwrap();
        let bytes = envelope.to_bytes().unwrap();
        let decoded = MessageEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(envelope, decoded);
    }
}
