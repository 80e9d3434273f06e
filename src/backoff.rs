use std::time::Duration;

use rand::Rng;

/// Doubling retry schedule with additive jitter, capped at a maximum.
///
/// The jitter stays strictly below the doubling step, so consecutive delays
/// are strictly increasing until the cap is reached; at the cap the delay is
/// exactly the cap.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Steeper schedule for rate-limit responses; the cap comes from
    /// configuration (`rate_limit_backoff_cap_secs`).
    pub fn rate_limit(cap: Duration) -> Self {
        Self::new(Duration::from_secs(2), cap)
    }

    /// Shorter schedule for other transient errors.
    pub fn transient() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let core = self
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.cap);
        if core >= self.cap {
            return self.cap;
        }
        let jitter_ceiling = (self.base / 2).as_millis().max(1) as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..jitter_ceiling));
        (core + jitter).min(self.cap)
    }
}
