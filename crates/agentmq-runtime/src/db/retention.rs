//! Retention jobs: purge DLQ rows and idempotency keys past their TTL.
//!
//! Both jobs are idempotent and safe to run concurrently on disjoint org
//! partitions. Counts come from the backend's affected-rows field; some
//! backends report response rows instead of actual deletions, so callers
//! should treat the count as best-effort.

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;

use agentmq_core::config::RetentionConfig;
use agentmq_core::error::QueueError;

use super::schema::{dlq_messages, idempotency_keys};
use super::{get_connection, DbPool};
use crate::metrics;

/// Cutoff for DLQ rows under the configured retention window.
pub fn dlq_cutoff(config: &RetentionConfig) -> DateTime<Utc> {
    Utc::now() - Duration::days(config.dlq_retention_days)
}

/// Cutoff for idempotency keys under the configured TTL.
pub fn idempotency_cutoff(config: &RetentionConfig) -> DateTime<Utc> {
    Utc::now() - Duration::days(config.idempotency_ttl_days)
}

/// Delete DLQ rows older than the cutoff, optionally for a single org.
/// Returns the affected-rows count reported by the backend.
pub async fn purge_dlq(
    pool: &DbPool,
    org_id: Option<&str>,
    cutoff: DateTime<Utc>,
) -> Result<usize, QueueError> {
    let mut conn = get_connection(pool)?;

    let deleted = match org_id {
        Some(org) => diesel::delete(
            dlq_messages::table
                .filter(dlq_messages::dlq_timestamp.lt(cutoff))
                .filter(dlq_messages::org_id.eq(org)),
        )
        .execute(&mut conn),
        None => diesel::delete(dlq_messages::table.filter(dlq_messages::dlq_timestamp.lt(cutoff)))
            .execute(&mut conn),
    }
    .map_err(|e| QueueError::Database {
        message: format!("Failed to purge DLQ rows: {}", e),
    })?;

    metrics::DLQ_PURGED_TOTAL
        .with_label_values(&[org_id.unwrap_or("all")])
        .inc_by(deleted as u64);
    tracing::info!(
        deleted,
        cutoff = %cutoff,
        org_id = org_id.unwrap_or("all"),
        "purged DLQ rows"
    );
    Ok(deleted)
}

/// Delete idempotency keys created before the cutoff. Returns the
/// affected-rows count reported by the backend.
pub async fn purge_idempotency(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
) -> Result<usize, QueueError> {
    let mut conn = get_connection(pool)?;

    let deleted = diesel::delete(
        idempotency_keys::table.filter(idempotency_keys::created_at.lt(cutoff)),
    )
    .execute(&mut conn)
    .map_err(|e| QueueError::Database {
        message: format!("Failed to purge idempotency keys: {}", e),
    })?;

    metrics::IDEMPOTENCY_PURGED_TOTAL.inc_by(deleted as u64);
    tracing::info!(deleted, cutoff = %cutoff, "purged idempotency keys");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoffs_respect_configured_windows() {
        let config = RetentionConfig {
            dlq_retention_days: 90,
            idempotency_ttl_days: 30,
        };
        let now = Utc::now();
        let dlq = dlq_cutoff(&config);
        let idem = idempotency_cutoff(&config);
        assert!((now - dlq).num_days() == 90);
        assert!((now - idem).num_days() == 30);
        assert!(dlq < idem);
    }
}
