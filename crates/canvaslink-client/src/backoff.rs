//! Reconnect backoff policy: capped exponential with jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on the nominal delay.
    pub cap: Duration,
    /// Jitter fraction applied around the nominal delay (0.2 = ±20 %).
    pub jitter: f64,
    /// Attempt count at which the connection is considered to be in
    /// persistent retry mode.
    pub persistent_retry_after: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            jitter: 0.2,
            persistent_retry_after: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Nominal delay for a 1-based attempt count: `min(cap, base * 2^(n-1))`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base_ms = self.config.base.as_millis() as u64;
        let raw_ms = base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(raw_ms.min(self.config.cap.as_millis() as u64))
    }

    /// Jittered delay for a 1-based attempt count.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt).as_millis() as f64;
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        Duration::from_millis((nominal * factor).round() as u64)
    }

    /// Whether this attempt count has crossed the persistent-retry threshold.
    pub fn in_persistent_retry(&self, attempt: u32) -> bool {
        attempt >= self.config.persistent_retry_after
    }
}
