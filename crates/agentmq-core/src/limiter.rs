//! Per-org publish-rate and in-flight limits.
//!
//! The token bucket gates publisher admission: a denied publish returns
//! `RateLimited` to the caller, which retries with backoff. The in-flight
//! tracker bounds how many deliveries a consumer processes concurrently
//! per org.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct TokenBucket {
    tokens: f64,
    last_update: Instant,
    rate: f64,
    capacity: f64,
}

impl TokenBucket {
    fn new(rate: f64, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
            rate,
            capacity,
        }
    }

    fn consume(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }
}

/// Token-bucket admission control keyed by org id.
pub struct OrgRateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    rate: f64,
    burst: f64,
}

impl OrgRateLimiter {
    /// `rate` in messages per second; `burst` is the bucket capacity.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate,
            burst: burst.max(1) as f64,
        }
    }

    /// Take one token for the org; false means the publish is denied.
    pub fn try_acquire(&self, org_id: &str) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry(org_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.rate, self.burst));
        bucket.consume(1.0)
    }

    /// Drop buckets idle for more than five minutes.
    pub fn cleanup_stale(&self) {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_update) < Duration::from_secs(300));
    }
}

/// Counts in-flight deliveries per org; the count bounds consumer prefetch.
#[derive(Default)]
pub struct InFlightTracker {
    counts: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

/// RAII guard decrementing the org's in-flight count on drop.
pub struct InFlightPermit {
    count: Arc<AtomicUsize>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one in-flight delivery for the org.
    pub fn enter(&self, org_id: &str) -> InFlightPermit {
        let count = {
            let mut counts = self.counts.lock().unwrap();
            Arc::clone(
                counts
                    .entry(org_id.to_string())
                    .or_insert_with(|| Arc::new(AtomicUsize::new(0))),
            )
        };
        count.fetch_add(1, Ordering::SeqCst);
        InFlightPermit { count }
    }

    pub fn in_flight(&self, org_id: &str) -> usize {
        self.counts
            .lock()
            .unwrap()
            .get(org_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_denial() {
        let limiter = OrgRateLimiter::new(1.0, 3);
        assert!(limiter.try_acquire("o"));
        assert!(limiter.try_acquire("o"));
        assert!(limiter.try_acquire("o"));
        assert!(!limiter.try_acquire("o"));
    }

    #[test]
    fn test_orgs_are_isolated() {
        let limiter = OrgRateLimiter::new(1.0, 1);
        assert!(limiter.try_acquire("a"));
        assert!(!limiter.try_acquire("a"));
        assert!(limiter.try_acquire("b"));
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let limiter = OrgRateLimiter::new(1000.0, 1);
        assert!(limiter.try_acquire("o"));
        assert!(!limiter.try_acquire("o"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.try_acquire("o"));
    }

    #[test]
    fn test_in_flight_tracking() {
        let tracker = InFlightTracker::new();
        assert_eq!(tracker.in_flight("o"), 0);
        let a = tracker.enter("o");
        let b = tracker.enter("o");
        assert_eq!(tracker.in_flight("o"), 2);
        drop(a);
        assert_eq!(tracker.in_flight("o"), 1);
        drop(b);
        assert_eq!(tracker.in_flight("o"), 0);
    }
}
