//! Retry schedule for transient delivery failures.

use rand::Rng;
use std::time::Duration;

/// First-attempt backoff base
pub const RETRY_BASE: Duration = Duration::from_secs(1);

/// Backoff ceiling
pub const RETRY_CAP: Duration = Duration::from_secs(20);

/// Attempts before a message is marked failed
pub const MAX_ATTEMPTS: u32 = 8;

/// Exponential backoff with full jitter.
///
/// The delay for attempt `n` is drawn uniformly from
/// `[0, min(cap, base * 2^(n-1))]` so simultaneous retries from both
/// participants spread out instead of colliding on the same schedule.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    /// Policy with production timings
    pub fn new() -> Self {
        Self {
            base: RETRY_BASE,
            cap: RETRY_CAP,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// Policy with custom timings (tests)
    pub fn with_timing(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Whether another attempt is permitted after `attempts` tries
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Maximum attempts before failure
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Jittered delay before attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base
            .saturating_mul(1u32 << exp)
            .min(self.cap);
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(0..=ceiling_ms);
        Duration::from_millis(jittered)
    }

    /// Upper bound of the delay for attempt `attempt`, without jitter
    pub fn delay_ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}
