//! Token-bucket rate limiter for externally-originated appends.

use std::time::Instant;

/// Refills `rate_per_sec` tokens each second up to `burst`. A request
/// either takes its tokens whole or is refused; tokens are never owed.
#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    rate_per_sec: u64,
    burst: u64,
    available: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A zero rate disables the bucket entirely. A zero burst defaults
    /// to one second's worth of tokens.
    pub(crate) fn new(rate_per_sec: u64, burst: u64) -> Self {
        Self::new_at(rate_per_sec, burst, Instant::now())
    }

    fn new_at(rate_per_sec: u64, burst: u64, now: Instant) -> Self {
        let burst = if burst == 0 { rate_per_sec.max(1) } else { burst };
        Self {
            rate_per_sec,
            burst,
            available: burst,
            last_refill: now,
        }
    }

    pub(crate) fn try_take(&mut self, tokens: u64) -> bool {
        self.try_take_at(tokens, Instant::now())
    }

    pub(crate) fn try_take_at(&mut self, tokens: u64, now: Instant) -> bool {
        if self.rate_per_sec == 0 || tokens == 0 {
            return true;
        }

        if now > self.last_refill {
            let elapsed_ms = now.duration_since(self.last_refill).as_millis() as u64;
            if elapsed_ms > 0 {
                let added = self
                    .rate_per_sec
                    .saturating_mul(elapsed_ms)
                    .saturating_div(1000);
                self.available = self.available.saturating_add(added).min(self.burst);
                self.last_refill = now;
            }
        }

        if tokens <= self.available {
            self.available -= tokens;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod rate_tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_refusal() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(100, 100, start);

        assert!(bucket.try_take_at(50, start));
        assert!(bucket.try_take_at(50, start));
        assert!(!bucket.try_take_at(1, start));
    }

    #[test]
    fn test_refill_restores_tokens() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(100, 100, start);

        assert!(bucket.try_take_at(100, start));
        assert!(!bucket.try_take_at(10, start));

        // 500ms at 100/s refills 50 tokens
        let later = start + Duration::from_millis(500);
        assert!(bucket.try_take_at(50, later));
        assert!(!bucket.try_take_at(1, later));
    }

    #[test]
    fn test_refill_caps_at_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(100, 10, start);

        assert!(bucket.try_take_at(10, start));

        let much_later = start + Duration::from_secs(60);
        assert!(bucket.try_take_at(10, much_later));
        assert!(!bucket.try_take_at(1, much_later));
    }

    #[test]
    fn test_refusal_leaves_tokens_intact() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(100, 10, start);

        assert!(!bucket.try_take_at(11, start));
        assert!(bucket.try_take_at(10, start));
    }

    #[test]
    fn test_zero_rate_disables_limiting() {
        let mut bucket = TokenBucket::new(0, 0);
        let now = Instant::now();
        assert!(bucket.try_take_at(10_000, now));
        assert!(bucket.try_take_at(10_000, now));
    }
}
