//! Time utilities.
//!
//! Wall-clock timestamps in microseconds and milliseconds, plus the UTC
//! trading-day index used to reset daily loss accounting.

use std::time::{SystemTime, UNIX_EPOCH};

const US_PER_DAY: u64 = 86_400 * 1_000_000;

/// Current time as **microseconds** since Unix epoch.
#[inline]
pub fn now_us() -> u64 {
    let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    d.as_secs() * 1_000_000 + u64::from(d.subsec_micros())
}

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    now_us() / 1_000
}

/// UTC day index (days since epoch) containing `ts_us`.
#[inline]
pub fn trading_day(ts_us: u64) -> u64 {
    ts_us / US_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_agree() {
        let us = now_us();
        let ms = now_ms();
        assert!(ms >= us / 1_000);
        assert!(ms - us / 1_000 < 1_000);
    }

    #[test]
    fn day_boundaries() {
        assert_eq!(trading_day(0), 0);
        assert_eq!(trading_day(US_PER_DAY - 1), 0);
        assert_eq!(trading_day(US_PER_DAY), 1);
    }
}
