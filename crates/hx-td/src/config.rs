//! Gateway retry and retention settings.
//!
//! The serde-facing [`GatewayConfig`] lives in `hx_core::config` with the
//! rest of the application config; this module turns it into the values the
//! gateway works with.

use std::time::Duration;

pub use hx_core::config::GatewayConfig;

/// Exponential backoff schedule for transient exchange failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base: Duration::from_millis(cfg.base_backoff_ms),
            max: Duration::from_millis(cfg.max_backoff_ms.max(cfg.base_backoff_ms)),
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max`.
    pub fn delay(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}

/// Idempotency-key retention window in microseconds.
pub fn idempotency_ttl_us(cfg: &GatewayConfig) -> u64 {
    cfg.idempotency_ttl_secs.saturating_mul(1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = GatewayConfig { base_backoff_ms: 100, max_backoff_ms: 500, ..Default::default() };
        let p = RetryPolicy::from_config(&cfg);
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
        assert_eq!(p.delay(4), Duration::from_millis(500));
        assert_eq!(p.delay(60), Duration::from_millis(500));
    }

    #[test]
    fn zero_attempts_clamped() {
        let cfg = GatewayConfig { max_attempts: 0, ..Default::default() };
        assert_eq!(RetryPolicy::from_config(&cfg).max_attempts, 1);
    }
}
