//! Per-connection token bucket. Cost is charged in payload bytes, so one
//! bucket bounds both message rate and inbound bandwidth.

use std::time::Instant;

/// Bucket capacity in byte-tokens.
pub(crate) const RATE_CAPACITY: f64 = 100_000.0;
/// Refill rate in byte-tokens per second.
pub(crate) const RATE_REFILL: f64 = 10_000.0;

pub(crate) struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn per_connection() -> Self {
        Self::new(RATE_CAPACITY, RATE_REFILL)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Deduct `cost` tokens if available.
    pub fn acquire(&mut self, cost: f64) -> bool {
        self.refill();
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Milliseconds until `cost` tokens will be available. Carried in
    /// `MESSAGE_RATE_LIMITED` replies as `retry_after`.
    pub fn retry_after_ms(&mut self, cost: f64) -> u64 {
        self.refill();
        let deficit = (cost - self.tokens).max(0.0);
        ((deficit / self.refill_rate) * 1000.0).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_within_capacity() {
        let mut bucket = TokenBucket::new(100.0, 10.0);
        assert!(bucket.acquire(60.0));
        assert!(bucket.acquire(40.0));
        assert!(!bucket.acquire(1.0));
    }

    #[test]
    fn test_refill_over_time() {
        let mut bucket = TokenBucket::new(100.0, 1000.0);
        assert!(bucket.acquire(100.0));
        assert!(!bucket.acquire(50.0));
        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(bucket.acquire(50.0));
    }

    #[test]
    fn test_retry_after_reflects_deficit() {
        let mut bucket = TokenBucket::new(100.0, 100.0);
        assert!(bucket.acquire(100.0));
        let wait = bucket.retry_after_ms(50.0);
        assert!(wait > 0 && wait <= 600, "wait was {wait}");
    }

    #[test]
    fn test_retry_after_zero_when_available() {
        let mut bucket = TokenBucket::new(100.0, 10.0);
        assert_eq!(bucket.retry_after_ms(10.0), 0);
    }
}
