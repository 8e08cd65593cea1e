//! Database records for the audit and gating tables.
//!
//! These mirror the shapes the audit pipeline writes: latest state per
//! message, append-only lifecycle events, and terminal DLQ rows.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agentmq_core::envelope::MessageEnvelope;
use agentmq_core::lifecycle::MessageStatus;

use super::schema::{dlq_messages, idempotency_keys, message_events, messages, poison_counters};

/// Row for the `messages` table capturing the latest message state.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = messages)]
pub struct MessageRecord {
    pub message_id: Uuid,
    pub org_id: String,
    pub agent_id: Option<String>,
    pub message_type: Option<String>,
    pub priority: Option<i32>,
    pub status: String,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Snapshot of an envelope at a lifecycle state.
    pub fn from_envelope(envelope: &MessageEnvelope, status: MessageStatus) -> Self {
        Self {
            message_id: envelope.message_id,
            org_id: envelope.org_id.clone(),
            agent_id: envelope.agent_id.clone(),
            message_type: Some(envelope.message_type.clone()),
            priority: Some(envelope.priority as i32),
            status: status.as_str().to_string(),
            payload: envelope.payload.clone(),
            updated_at: Utc::now(),
        }
    }
}

/// Row for the `message_events` table capturing lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = message_events)]
pub struct MessageEventRecord {
    pub id: Uuid,
    pub message_id: Option<Uuid>,
    pub org_id: String,
    pub event_type: String,
    pub details: Option<serde_json::Value>,
    pub ts: DateTime<Utc>,
}

impl MessageEventRecord {
    pub fn new(
        message_id: Option<Uuid>,
        org_id: impl Into<String>,
        event_type: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id,
            org_id: org_id.into(),
            event_type: event_type.into(),
            details,
            ts: Utc::now(),
        }
    }
}

/// Row for the `dlq_messages` table for terminal failures.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = dlq_messages)]
pub struct DlqMessageRecord {
    pub id: Uuid,
    pub org_id: String,
    pub original_message: serde_json::Value,
    pub error: serde_json::Value,
    pub can_replay: bool,
    pub dlq_timestamp: DateTime<Utc>,
}

impl DlqMessageRecord {
    pub fn new(
        org_id: impl Into<String>,
        original_message: serde_json::Value,
        error: serde_json::Value,
        can_replay: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: org_id.into(),
            original_message,
            error,
            can_replay,
            dlq_timestamp: Utc::now(),
        }
    }
}

/// Row for the `idempotency_keys` table; unique on `(org_id, dedup_key)`.
#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = idempotency_keys)]
pub struct IdempotencyKeyRecord {
    pub org_id: String,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
}

/// Row for the `poison_counters` table; unique on `(org_id, dedup_key)`.
#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = poison_counters)]
pub struct PoisonCounterRecord {
    pub org_id: String,
    pub dedup_key: String,
    pub count: i32,
    pub updated_at: DateTime<Utc>,
}
