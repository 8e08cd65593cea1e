//! Poison message detection.
//!
//! Tracks repeated failures of the same dedup key and quarantines once
//! the threshold is crossed. Backend errors downgrade to "not
//! quarantined" (fail-open) and are surfaced as a metric.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;

use super::models::PoisonCounterRecord;
use super::schema::poison_counters;
use super::{get_connection, DbPool};
use crate::metrics;

/// Failure counting and quarantine decisions per `(org_id, dedup_key)`.
#[async_trait]
pub trait PoisonStore: Send + Sync {
    /// Record one terminal-looking failure; returns the running count.
    async fn increment_failure(&self, org_id: &str, dedup_key: &str) -> i32;

    /// Whether the failure count has reached the quarantine threshold.
    async fn should_quarantine(&self, org_id: &str, dedup_key: &str) -> bool;

    /// Clear the counter when the message completes.
    async fn reset(&self, org_id: &str, dedup_key: &str);
}

/// PostgreSQL implementation using an upsert counter.
pub struct PostgresPoisonStore {
    pool: DbPool,
    threshold: i32,
}

impl PostgresPoisonStore {
    pub fn new(pool: DbPool, threshold: i32) -> Self {
        Self { pool, threshold }
    }
}

#[async_trait]
impl PoisonStore for PostgresPoisonStore {
    async fn increment_failure(&self, org_id: &str, dedup_key: &str) -> i32 {
        let mut conn = match get_connection(&self.pool) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("poison increment failing open: {}", e);
                metrics::POISON_FAIL_OPEN_TOTAL.inc();
                return 1;
            }
        };

        let record = PoisonCounterRecord {
            org_id: org_id.to_string(),
            dedup_key: dedup_key.to_string(),
            count: 1,
            updated_at: Utc::now(),
        };

        let result = diesel::insert_into(poison_counters::table)
            .values(&record)
            .on_conflict((poison_counters::org_id, poison_counters::dedup_key))
            .do_update()
            .set((
                poison_counters::count.eq(poison_counters::count + 1),
                poison_counters::updated_at.eq(Utc::now()),
            ))
            .returning(poison_counters::count)
            .get_result::<i32>(&mut conn);

        match result {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(org_id, dedup_key, "poison increment failing open: {}", e);
                metrics::POISON_FAIL_OPEN_TOTAL.inc();
                1
            }
        }
    }

    async fn should_quarantine(&self, org_id: &str, dedup_key: &str) -> bool {
        let mut conn = match get_connection(&self.pool) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("poison lookup failing open: {}", e);
                metrics::POISON_FAIL_OPEN_TOTAL.inc();
                return false;
            }
        };

        let current = poison_counters::table
            .filter(poison_counters::org_id.eq(org_id))
            .filter(poison_counters::dedup_key.eq(dedup_key))
            .select(poison_counters::count)
            .first::<i32>(&mut conn)
            .optional();

        match current {
            Ok(count) => count.unwrap_or(0) >= self.threshold,
            Err(e) => {
                tracing::warn!(org_id, dedup_key, "poison lookup failing open: {}", e);
                metrics::POISON_FAIL_OPEN_TOTAL.inc();
                false
            }
        }
    }

    async fn reset(&self, org_id: &str, dedup_key: &str) {
        let mut conn = match get_connection(&self.pool) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("poison reset skipped: {}", e);
                return;
            }
        };

        if let Err(e) = diesel::delete(
            poison_counters::table
                .filter(poison_counters::org_id.eq(org_id))
                .filter(poison_counters::dedup_key.eq(dedup_key)),
        )
        .execute(&mut conn)
        {
            tracing::warn!(org_id, dedup_key, "poison reset failed: {}", e);
        }
    }
}
