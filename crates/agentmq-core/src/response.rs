//! Response payloads delivered back to the originating agent's queue.
//!
//! Six shapes keyed by `request_id` (the original `message_id`) and
//! `timestamp` (the original `created_at`). Error payloads are permitted
//! without an originating envelope, in which case `request_id` is null.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::MessageEnvelope;

/// Body of an error response payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Payload published to `agent.<agent>.responses.x`.
///
/// For one `request_id` the observed sequence respects
/// `acknowledgment ≺ {progress*, stream_chunk(i) ≺ stream_chunk(i+1)} ≺
/// stream_complete ≺ {result | error}`; ordering is enforced by publishing
/// on a single channel, not by the payloads themselves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Acknowledgment {
        request_id: Option<Uuid>,
        timestamp: DateTime<Utc>,
    },
    Progress {
        request_id: Option<Uuid>,
        progress: u32,
        status: String,
        timestamp: DateTime<Utc>,
    },
    StreamChunk {
        request_id: Option<Uuid>,
        chunk: String,
        chunk_index: u32,
        timestamp: DateTime<Utc>,
    },
    StreamComplete {
        request_id: Option<Uuid>,
        total_chunks: u32,
        timestamp: DateTime<Utc>,
    },
    Result {
        request_id: Option<Uuid>,
        result: Value,
        timestamp: DateTime<Utc>,
    },
    Error {
        request_id: Option<Uuid>,
        error: ErrorBody,
        timestamp: DateTime<Utc>,
    },
}

impl ResponsePayload {
    pub fn acknowledgment(orig: &MessageEnvelope) -> Self {
        ResponsePayload::Acknowledgment {
            request_id: Some(orig.message_id),
            timestamp: orig.created_at,
        }
    }

    pub fn progress(orig: &MessageEnvelope, progress: u32, status: impl Into<String>) -> Self {
        ResponsePayload::Progress {
            request_id: Some(orig.message_id),
            progress,
            status: status.into(),
            timestamp: orig.created_at,
        }
    }

    pub fn stream_chunk(orig: &MessageEnvelope, chunk: impl Into<String>, chunk_index: u32) -> Self {
        ResponsePayload::StreamChunk {
            request_id: Some(orig.message_id),
            chunk: chunk.into(),
            chunk_index,
            timestamp: orig.created_at,
        }
    }

    pub fn stream_complete(orig: &MessageEnvelope, total_chunks: u32) -> Self {
        ResponsePayload::StreamComplete {
            request_id: Some(orig.message_id),
            total_chunks,
            timestamp: orig.created_at,
        }
    }

    pub fn result(orig: &MessageEnvelope, result: Value) -> Self {
        ResponsePayload::Result {
            request_id: Some(orig.message_id),
            result,
            timestamp: orig.created_at,
        }
    }

    /// Error payloads may lack an originating envelope; `request_id` is
    /// then null and the timestamp is the time of emission.
    pub fn error(
        orig: Option<&MessageEnvelope>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ResponsePayload::Error {
            request_id: orig.map(|o| o.message_id),
            error: ErrorBody {
                error_type: error_type.into(),
                message: message.into(),
            },
            timestamp: orig.map(|o| o.created_at).unwrap_or_else(Utc::now),
        }
    }

    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            ResponsePayload::Acknowledgment { request_id, .. }
            | ResponsePayload::Progress { request_id, .. }
            | ResponsePayload::StreamChunk { request_id, .. }
            | ResponsePayload::StreamComplete { request_id, .. }
            | ResponsePayload::Result { request_id, .. }
            | ResponsePayload::Error { request_id, .. } => *request_id,
        }
    }

    /// Wire name of the payload kind, as carried in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ResponsePayload::Acknowledgment { .. } => "acknowledgment",
            ResponsePayload::Progress { .. } => "progress",
            ResponsePayload::StreamChunk { .. } => "stream_chunk",
            ResponsePayload::StreamComplete { .. } => "stream_complete",
            ResponsePayload::Result { .. } => "result",
            ResponsePayload::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn origin() -> MessageEnvelope {
        MessageEnvelope::validate(&json!({
            "message_id": "9f0c2d0a-0b1e-4c3d-8e4f-5a6b7c8d9e0f",
            "version": "1.0.0",
            "org_id": "demo-org",
            "type": "agent_message",
            "created_by": {"type": "system", "id": "test"},
            "created_at": "2025-01-01T00:00:00Z",
        }))
        .unwrap()
    }

    #[test]
    fn test_acknowledgment_shape() {
        let orig = origin();
        let value = serde_json::to_value(ResponsePayload::acknowledgment(&orig)).unwrap();
        assert_eq!(
            value,
            json!({
                "request_id": "9f0c2d0a-0b1e-4c3d-8e4f-5a6b7c8d9e0f",
                "type": "acknowledgment",
                "timestamp": "2025-01-01T00:00:00Z",
            })
        );
    }

    #[test]
    fn test_progress_shape() {
        let value =
            serde_json::to_value(ResponsePayload::progress(&origin(), 40, "loading")).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["progress"], 40);
        assert_eq!(value["status"], "loading");
        assert_eq!(value["timestamp"], "2025-01-01T00:00:00Z");
    }

    #[test]
    fn test_stream_chunk_and_complete_shapes() {
        let orig = origin();
        let chunk = serde_json::to_value(ResponsePayload::stream_chunk(&orig, "Hello", 0)).unwrap();
        assert_eq!(chunk["type"], "stream_chunk");
        assert_eq!(chunk["chunk"], "Hello");
        assert_eq!(chunk["chunk_index"], 0);

        let complete =
            serde_json::to_value(ResponsePayload::stream_complete(&orig, 2)).unwrap();
        assert_eq!(complete["type"], "stream_complete");
        assert_eq!(complete["total_chunks"], 2);
    }

    #[test]
    fn test_result_shape() {
        let value =
            serde_json::to_value(ResponsePayload::result(&origin(), json!({"ok": true}))).unwrap();
        assert_eq!(value["type"], "result");
        assert_eq!(value["result"], json!({"ok": true}));
    }

    #[test]
    fn test_error_shape() {
        let value = serde_json::to_value(ResponsePayload::error(
            Some(&origin()),
            "TransientHandlerError",
            "upstream timed out",
        ))
        .unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["type"], "TransientHandlerError");
        assert_eq!(value["error"]["message"], "upstream timed out");
        assert_eq!(value["request_id"], "9f0c2d0a-0b1e-4c3d-8e4f-5a6b7c8d9e0f");
    }

    #[test]
    fn test_error_without_origin() {
        let payload = ResponsePayload::error(None, "BrokerError", "oops");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["request_id"], json!(null));
        assert_eq!(value["error"]["type"], "BrokerError");
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = ResponsePayload::stream_chunk(&origin(), "data", 3);
        let value = serde_json::to_value(&payload).unwrap();
        let decoded: ResponsePayload = serde_json::from_value(value).unwrap();
        assert_eq!(payload, decoded);
    }
}
