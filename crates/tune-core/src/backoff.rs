//! Randomized retry intervals.
//!
//! Workers across a fleet retry against the same store and the same hosts;
//! uniform jitter keeps them from retrying in lockstep.

use std::time::Duration;

/// A uniformly random duration in `[0, max)`, at millisecond resolution.
///
/// Falls back to `max / 2` if the OS random source is unavailable.
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    match random_u64() {
        Some(r) => Duration::from_millis(r % max_ms),
        None => max / 2,
    }
}

/// A uniformly random duration in `[min, max)`.
pub fn jitter_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    min + jitter(max - min)
}

fn random_u64() -> Option<u64> {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf).ok()?;
    Some(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_below_max() {
        let max = Duration::from_millis(250);
        for _ in 0..100 {
            assert!(jitter(max) < max);
        }
    }

    #[test]
    fn zero_max_is_zero() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn between_respects_bounds() {
        let lo = Duration::from_secs(1);
        let hi = Duration::from_secs(30);
        for _ in 0..100 {
            let d = jitter_between(lo, hi);
            assert!(d >= lo && d < hi);
        }
        assert_eq!(jitter_between(hi, lo), hi);
    }
}
