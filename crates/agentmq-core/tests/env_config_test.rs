//! Environment-driven configuration tests.
//!
//! These mutate process environment variables, so they are serialized.

use agentmq_core::config::{self, RetentionConfig};
use serial_test::serial;

#[test]
#[serial]
fn test_dlq_retention_default() {
    std::env::remove_var("DLQ_RETENTION_DAYS");
    std::env::remove_var("IDEMPOTENCY_TTL_DAYS");
    let retention = RetentionConfig::from_env().unwrap();
    assert_eq!(retention.dlq_retention_days, 90);
    assert_eq!(retention.idempotency_ttl_days, 30);
}

#[test]
#[serial]
fn test_dlq_retention_env_override() {
    std::env::set_var("DLQ_RETENTION_DAYS", "7");
    let retention = RetentionConfig::from_env().unwrap();
    assert_eq!(retention.dlq_retention_days, 7);
    std::env::remove_var("DLQ_RETENTION_DAYS");
}

#[test]
#[serial]
fn test_retention_rejects_garbage() {
    std::env::set_var("DLQ_RETENTION_DAYS", "ninety");
    assert!(RetentionConfig::from_env().is_err());
    std::env::remove_var("DLQ_RETENTION_DAYS");
}

#[test]
#[serial]
fn test_retry_policy_from_env() {
    std::env::set_var("RETRY_DELAYS_MS", "100,200,400");
    std::env::set_var("MAX_RETRIES", "2");
    std::env::remove_var("RETRY_JITTER");

    let policy = config::retry_from_env().unwrap();
    assert_eq!(policy.delays_ms, vec![100, 200, 400]);
    assert_eq!(policy.max_retries, 2);
    assert_eq!(policy.jitter, 0.0);

    std::env::remove_var("RETRY_DELAYS_MS");
    std::env::remove_var("MAX_RETRIES");
}

#[test]
#[serial]
fn test_retry_policy_defaults() {
    std::env::remove_var("RETRY_DELAYS_MS");
    std::env::remove_var("MAX_RETRIES");
    std::env::remove_var("RETRY_JITTER");

    let policy = config::retry_from_env().unwrap();
    assert_eq!(policy.delays_ms, vec![1000, 2000, 4000, 8000]);
    assert_eq!(policy.max_retries, 4);
}
