//! Exponential backoff with jitter for list/watch retries.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Upper bound of the uniform jitter added to every delay.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
        }
    }
}

/// Doubling delay, capped, with uniform jitter. Reset on success.
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let current = policy.base;
        Self { policy, current }
    }

    pub fn reset(&mut self) {
        self.current = self.policy.base;
    }

    pub fn next_delay(&mut self) -> Duration {
        let jitter_ms = self.policy.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::random::<u64>() % jitter_ms)
        };
        let delay = self.current + jitter;
        self.current = (self.current * 2).min(self.policy.cap);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, cap_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn doubles_until_cap() {
        let mut b = Backoff::new(policy(100, 450));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(400));
        assert_eq!(b.next_delay(), Duration::from_millis(450));
        assert_eq!(b.next_delay(), Duration::from_millis(450));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut b = Backoff::new(policy(100, 800));
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let mut b = Backoff::new(BackoffPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
        });
        for _ in 0..100 {
            let d = b.next_delay();
            assert!(d >= Duration::from_millis(100) && d < Duration::from_millis(150));
        }
    }
}
