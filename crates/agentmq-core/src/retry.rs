//! Retry policy: maps a retry count to the next delay.
//!
//! The delay ladder is indexed with a saturating clamp, so attempts past
//! the end of the ladder reuse its last entry. Jitter draws uniformly in
//! `base * [1 - j, 1 + j]`.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Default delay ladder in milliseconds.
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 4] = [1000, 2000, 4000, 8000];

/// Default number of attempts before a message routes to the DLQ.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Ordered list of retry wait times in milliseconds.
    pub delays_ms: Vec<u64>,

    /// Jitter fraction in [0, 1]; 0 disables jitter.
    pub jitter: f64,

    /// Attempts before the caller must route to the DLQ.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays_ms: DEFAULT_RETRY_DELAYS_MS.to_vec(),
            jitter: 0.0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(delays_ms: Vec<u64>, jitter: f64, max_retries: u32) -> Result<Self, QueueError> {
        let policy = Self {
            delays_ms,
            jitter,
            max_retries,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.delays_ms.is_empty() {
            return Err(QueueError::Configuration {
                message: "retry delay ladder must not be empty".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(QueueError::Configuration {
                message: format!("retry jitter {} out of range 0..=1", self.jitter),
            });
        }
        Ok(())
    }

    /// Ladder entry for a zero-based retry count, without jitter.
    ///
    /// This is the bucket that selects the broker delay queue, whose TTL is
    /// fixed at declaration time.
    pub fn bucket_ms(&self, retry_count: u32) -> u64 {
        let idx = (retry_count as usize).min(self.delays_ms.len() - 1);
        self.delays_ms[idx]
    }

    /// Next delay in milliseconds for a zero-based retry count.
    pub fn next_delay_ms(&self, retry_count: u32) -> u64 {
        let base = self.bucket_ms(retry_count);
        if self.jitter <= 0.0 {
            return base;
        }
        let delta = base as f64 * self.jitter;
        let low = base as f64 - delta;
        let high = base as f64 + delta;
        rand::thread_rng().gen_range(low..=high).round() as u64
    }

    /// Whether the retry budget is spent and the message belongs in the DLQ.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_ladder_without_jitter() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay_ms(0), 1000);
        assert_eq!(policy.next_delay_ms(1), 2000);
        assert_eq!(policy.next_delay_ms(2), 4000);
        assert_eq!(policy.next_delay_ms(3), 8000);
    }

    #[test]
    fn test_delay_clamps_to_last_entry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay_ms(4), 8000);
        assert_eq!(policy.next_delay_ms(100), 8000);
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::new(vec![1000], 0.5, 4).unwrap();
        for _ in 0..200 {
            let delay = policy.next_delay_ms(0);
            assert!((500..=1500).contains(&delay), "delay {} out of bounds", delay);
        }
    }

    #[test]
    fn test_exhaustion() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(RetryPolicy::new(vec![], 0.0, 4).is_err());
        assert!(RetryPolicy::new(vec![1000], 1.5, 4).is_err());
    }
}
