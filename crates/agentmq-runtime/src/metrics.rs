/*!
# Prometheus Metrics

Counters and gauges for the publish path, the consumer harness, the
fail-open stores, and the audit pipeline. Fail-open counters exist so
operators can detect a degraded backend that the data plane is papering
over.
*/

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Messages admitted and published to org request exchanges
    pub static ref MESSAGES_PUBLISHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("messages_published_total", "Messages published to org request exchanges")
            .namespace("agentmq"),
        &["org_id"]
    ).unwrap();

    /// Deliveries processed by the consumer harness, labelled by outcome
    pub static ref MESSAGES_CONSUMED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("messages_consumed_total", "Deliveries processed by the consumer harness")
            .namespace("agentmq"),
        &["org_id", "outcome"]
    ).unwrap();

    /// Retries handed to the delay queues
    pub static ref RETRIES_SCHEDULED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("retries_scheduled_total", "Retries scheduled into delay queues")
            .namespace("agentmq"),
        &["org_id"]
    ).unwrap();

    /// Messages routed to the dead-letter queue
    pub static ref DLQ_MESSAGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dlq_messages_total", "Messages routed to the dead-letter queue")
            .namespace("agentmq"),
        &["org_id"]
    ).unwrap();

    /// Deliveries skipped by the idempotency gate
    pub static ref DUPLICATES_SKIPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("duplicates_skipped_total", "Deliveries skipped as duplicates")
            .namespace("agentmq"),
        &["org_id"]
    ).unwrap();

    /// Messages quarantined by poison detection
    pub static ref POISON_QUARANTINED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("poison_quarantined_total", "Messages quarantined by poison detection")
            .namespace("agentmq"),
        &["org_id"]
    ).unwrap();

    /// Publisher admissions denied by the per-org token bucket
    pub static ref RATE_LIMITED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rate_limited_total", "Publisher admissions denied by rate limiting")
            .namespace("agentmq"),
        &["org_id"]
    ).unwrap();

    /// Deliveries currently being processed
    pub static ref INFLIGHT_MESSAGES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("inflight_messages", "Deliveries currently being processed")
            .namespace("agentmq"),
        &["org_id"]
    ).unwrap();

    /// Audit batches dropped after exhausting write retries
    pub static ref AUDIT_WRITE_FAILED_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("audit_write_failed_total", "Audit batches dropped after exhausting write retries")
            .namespace("agentmq"),
    ).unwrap();

    /// Audit events dropped because the in-memory queue was full
    pub static ref AUDIT_EVENTS_DROPPED_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("audit_events_dropped_total", "Audit events dropped due to a full queue")
            .namespace("agentmq"),
    ).unwrap();

    /// Idempotency backend errors resolved as FIRST (fail-open)
    pub static ref IDEMPOTENCY_FAIL_OPEN_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("idempotency_fail_open_total", "Idempotency backend errors resolved fail-open")
            .namespace("agentmq"),
    ).unwrap();

    /// Poison backend errors resolved as not-quarantined (fail-open)
    pub static ref POISON_FAIL_OPEN_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("poison_fail_open_total", "Poison backend errors resolved fail-open")
            .namespace("agentmq"),
    ).unwrap();

    /// DLQ rows purged by the retention job
    pub static ref DLQ_PURGED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dlq_purged_total", "DLQ rows purged by retention")
            .namespace("agentmq"),
        &["org_id"]
    ).unwrap();

    /// Idempotency keys purged by the retention job
    pub static ref IDEMPOTENCY_PURGED_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("idempotency_purged_total", "Idempotency keys purged by retention")
            .namespace("agentmq"),
    ).unwrap();
}

/// Register all metrics with the crate registry; safe to call once at
/// startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_PUBLISHED_TOTAL.clone()),
        Box::new(MESSAGES_CONSUMED_TOTAL.clone()),
        Box::new(RETRIES_SCHEDULED_TOTAL.clone()),
        Box::new(DLQ_MESSAGES_TOTAL.clone()),
        Box::new(DUPLICATES_SKIPPED_TOTAL.clone()),
        Box::new(POISON_QUARANTINED_TOTAL.clone()),
        Box::new(RATE_LIMITED_TOTAL.clone()),
        Box::new(INFLIGHT_MESSAGES.clone()),
        Box::new(AUDIT_WRITE_FAILED_TOTAL.clone()),
        Box::new(AUDIT_EVENTS_DROPPED_TOTAL.clone()),
        Box::new(IDEMPOTENCY_FAIL_OPEN_TOTAL.clone()),
        Box::new(POISON_FAIL_OPEN_TOTAL.clone()),
        Box::new(DLQ_PURGED_TOTAL.clone()),
        Box::new(IDEMPOTENCY_PURGED_TOTAL.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::debug!("metric already registered: {}", e);
        }
    }
}

/// Render the registry in Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        register_metrics();
        register_metrics();
        MESSAGES_PUBLISHED_TOTAL.with_label_values(&["test-org"]).inc();
        let text = gather();
        assert!(text.contains("agentmq_messages_published_total"));
    }
}
