//! Idempotency store: first-writer-wins on `(org_id, dedup_key)`.
//!
//! Implemented as a bare insert; the unique-constraint violation maps to
//! `Duplicate`. Unexpected backend errors fail open to `First` so a
//! degraded database never blocks the pipeline; the fail-open rate is
//! exposed as a metric.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};

use super::models::IdempotencyKeyRecord;
use super::schema::idempotency_keys;
use super::{get_connection, DbPool};
use crate::metrics;

/// Outcome of claiming a dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// First claim; processing proceeds.
    First,
    /// Key already claimed; the delivery is a duplicate.
    Duplicate,
}

/// First-writer-wins claim on a logical message identity.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn mark_and_check(&self, org_id: &str, dedup_key: &str) -> MarkOutcome;
}

/// PostgreSQL implementation backed by a unique constraint.
pub struct PostgresIdempotencyStore {
    pool: DbPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn mark_and_check(&self, org_id: &str, dedup_key: &str) -> MarkOutcome {
        let mut conn = match get_connection(&self.pool) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("idempotency check failing open: {}", e);
                metrics::IDEMPOTENCY_FAIL_OPEN_TOTAL.inc();
                return MarkOutcome::First;
            }
        };

        let record = IdempotencyKeyRecord {
            org_id: org_id.to_string(),
            dedup_key: dedup_key.to_string(),
            created_at: Utc::now(),
        };

        match diesel::insert_into(idempotency_keys::table)
            .values(&record)
            .execute(&mut conn)
        {
            Ok(_) => MarkOutcome::First,
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                MarkOutcome::Duplicate
            }
            Err(e) => {
                tracing::warn!(org_id, dedup_key, "idempotency insert failing open: {}", e);
                metrics::IDEMPOTENCY_FAIL_OPEN_TOTAL.inc();
                MarkOutcome::First
            }
        }
    }
}
