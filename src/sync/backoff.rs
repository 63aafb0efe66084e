//! Retry backoff for transport failures
//!
//! Exponential with equal jitter: base 500 ms doubling per attempt,
//! capped at 8 s. After `max_retries` the controller stops retrying,
//! flags the document stale and waits for an explicit sync.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Jittered delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        // Equal jitter spreads concurrent retriers over the upper half
        // of the window without collapsing the delay
        let millis = exp.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }
}
