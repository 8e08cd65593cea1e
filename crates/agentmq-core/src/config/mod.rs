//! Configuration management for the message-queue control plane.
//!
//! All settings are environment-driven with documented defaults; only the
//! broker and database URLs are required. Each section has its own
//! `from_env` and `validate`, and [`QueueConfig::from_env`] composes them.

pub mod error;

pub use error::{ConfigError, ConfigResult};

use std::env;

use serde::{Deserialize, Serialize};

use crate::retry::{RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAYS_MS};

/// Main configuration for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub retry: RetryPolicy,
    pub poison_threshold: i32,
    pub retention: RetentionConfig,
    pub audit: AuditConfig,
    pub consumer: ConsumerConfig,
    pub rate_limit: RateLimitConfig,
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
}

/// Audit/idempotency backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

/// Row TTLs enforced by the retention jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub dlq_retention_days: i64,
    pub idempotency_ttl_days: i64,
}

/// Audit batcher sizing and flush cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub queue_max: usize,
}

/// Worker harness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub handler_deadline_ms: u64,
    pub shutdown_grace_ms: u64,
}

/// Per-org publisher admission and in-flight caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Messages per second per org; absent means unlimited.
    pub org_rate_limit: Option<f64>,
    /// Token bucket capacity; defaults to the rate rounded up.
    pub org_rate_burst: Option<u32>,
    /// Concurrent in-flight deliveries per org (consumer prefetch).
    pub org_max_in_flight: u16,
}

impl QueueConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        let config = Self {
            broker: BrokerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            retry: retry_from_env()?,
            poison_threshold: parse_env("POISON_THRESHOLD", 3)?,
            retention: RetentionConfig::from_env()?,
            audit: AuditConfig::from_env()?,
            consumer: ConsumerConfig::from_env()?,
            rate_limit: RateLimitConfig::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the complete configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;
        if self.poison_threshold < 1 {
            return Err(ConfigError::ValidationFailed(
                "POISON_THRESHOLD must be at least 1".to_string(),
            ));
        }
        self.retention.validate()?;
        self.audit.validate()?;
        self.consumer.validate()?;
        self.rate_limit.validate()?;
        Ok(())
    }
}

impl BrokerConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            url: env::var("BROKER_URL")
                .map_err(|_| ConfigError::EnvVarNotFound("BROKER_URL".to_string()))?,
        })
    }
}

impl DatabaseConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::EnvVarNotFound("DATABASE_URL".to_string()))?,
            pool_size: parse_env("DATABASE_POOL_SIZE", 10)?,
        })
    }
}

impl RetentionConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            dlq_retention_days: parse_env("DLQ_RETENTION_DAYS", 90)?,
            idempotency_ttl_days: parse_env("IDEMPOTENCY_TTL_DAYS", 30)?,
        })
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.dlq_retention_days < 1 || self.idempotency_ttl_days < 1 {
            return Err(ConfigError::ValidationFailed(
                "retention windows must be at least one day".to_string(),
            ));
        }
        Ok(())
    }
}

impl AuditConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            batch_size: parse_env("AUDIT_BATCH_SIZE", 50)?,
            flush_interval_ms: parse_env("AUDIT_FLUSH_MS", 500)?,
            queue_max: parse_env("AUDIT_QUEUE_MAX", 10_000)?,
        })
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "AUDIT_BATCH_SIZE must be greater than 0".to_string(),
            ));
        }
        if self.queue_max < self.batch_size {
            return Err(ConfigError::ValidationFailed(
                "AUDIT_QUEUE_MAX must be at least AUDIT_BATCH_SIZE".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval_ms: 500,
            queue_max: 10_000,
        }
    }
}

impl ConsumerConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            handler_deadline_ms: parse_env("HANDLER_DEADLINE_MS", 30_000)?,
            shutdown_grace_ms: parse_env("SHUTDOWN_GRACE_MS", 30_000)?,
        })
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.handler_deadline_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "HANDLER_DEADLINE_MS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            handler_deadline_ms: 30_000,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> ConfigResult<Self> {
        let org_rate_limit = match env::var("ORG_RATE_LIMIT") {
            Ok(raw) => Some(raw.parse::<f64>().map_err(|e| {
                ConfigError::ParseError(format!("ORG_RATE_LIMIT: {}", e))
            })?),
            Err(_) => None,
        };
        let org_rate_burst = match env::var("ORG_RATE_BURST") {
            Ok(raw) => Some(raw.parse::<u32>().map_err(|e| {
                ConfigError::ParseError(format!("ORG_RATE_BURST: {}", e))
            })?),
            Err(_) => None,
        };
        Ok(Self {
            org_rate_limit,
            org_rate_burst,
            org_max_in_flight: parse_env("ORG_MAX_IN_FLIGHT", 8)?,
        })
    }

    fn validate(&self) -> ConfigResult<()> {
        if let Some(rate) = self.org_rate_limit {
            if rate <= 0.0 {
                return Err(ConfigError::ValidationFailed(
                    "ORG_RATE_LIMIT must be positive when set".to_string(),
                ));
            }
        }
        if self.org_max_in_flight == 0 {
            return Err(ConfigError::ValidationFailed(
                "ORG_MAX_IN_FLIGHT must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective bucket capacity when a rate limit is configured.
    pub fn effective_burst(&self) -> Option<u32> {
        self.org_rate_limit
            .map(|rate| self.org_rate_burst.unwrap_or(rate.ceil() as u32).max(1))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            org_rate_limit: None,
            org_rate_burst: None,
            org_max_in_flight: 8,
        }
    }
}

/// Retry policy from `RETRY_DELAYS_MS` / `RETRY_JITTER` / `MAX_RETRIES`.
pub fn retry_from_env() -> ConfigResult<RetryPolicy> {
    let delays_ms = match env::var("RETRY_DELAYS_MS") {
        Ok(raw) => raw
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .map_err(|e| ConfigError::ParseError(format!("RETRY_DELAYS_MS: {}", e)))
            })
            .collect::<ConfigResult<Vec<u64>>>()?,
        Err(_) => DEFAULT_RETRY_DELAYS_MS.to_vec(),
    };
    Ok(RetryPolicy {
        delays_ms,
        jitter: parse_env("RETRY_JITTER", 0.0)?,
        max_retries: parse_env("MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
    })
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_config_validation() {
        let valid = AuditConfig::default();
        assert!(valid.validate().is_ok());

        let invalid = AuditConfig {
            batch_size: 0,
            ..AuditConfig::default()
        };
        assert!(invalid.validate().is_err());

        let undersized_queue = AuditConfig {
            batch_size: 100,
            queue_max: 10,
            ..AuditConfig::default()
        };
        assert!(undersized_queue.validate().is_err());
    }

    #[test]
    fn test_rate_limit_validation() {
        let unlimited = RateLimitConfig::default();
        assert!(unlimited.validate().is_ok());
        assert_eq!(unlimited.effective_burst(), None);

        let limited = RateLimitConfig {
            org_rate_limit: Some(10.0),
            org_rate_burst: None,
            org_max_in_flight: 8,
        };
        assert!(limited.validate().is_ok());
        assert_eq!(limited.effective_burst(), Some(10));

        let negative = RateLimitConfig {
            org_rate_limit: Some(-1.0),
            org_rate_burst: None,
            org_max_in_flight: 8,
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_retention_validation() {
        let valid = RetentionConfig {
            dlq_retention_days: 90,
            idempotency_ttl_days: 30,
        };
        assert!(valid.validate().is_ok());

        let invalid = RetentionConfig {
            dlq_retention_days: 0,
            idempotency_ttl_days: 30,
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_consumer_validation() {
        assert!(ConsumerConfig::default().validate().is_ok());
        let invalid = ConsumerConfig {
            handler_deadline_ms: 0,
            ..ConsumerConfig::default()
        };
        assert!(invalid.validate().is_err());
    }
}
