//! Time helpers
//!
//! Segment times are milliseconds everywhere inside the core; fractional
//! seconds exist only at the transcoder boundary. These helpers keep the
//! conversion in one place.

use chrono::{DateTime, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Milliseconds to fractional seconds (transcoder argument form)
pub fn ms_to_secs(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

/// Fractional seconds to milliseconds, rounding to nearest
pub fn secs_to_ms(secs: f64) -> u64 {
    if secs <= 0.0 {
        0
    } else {
        (secs * 1000.0).round() as u64
    }
}

/// Render seconds the way transcoder arguments expect them
pub fn fmt_secs(secs: f64) -> String {
    format!("{secs:.3}")
}

/// Convert milliseconds to a std Duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_at_millisecond_precision() {
        for ms in [0u64, 1, 999, 1000, 1001, 40_000, 3_600_000] {
            assert_eq!(secs_to_ms(ms_to_secs(ms)), ms);
        }
    }

    #[test]
    fn negative_seconds_clamp_to_zero() {
        assert_eq!(secs_to_ms(-1.5), 0);
    }

    #[test]
    fn fmt_secs_uses_three_decimals() {
        assert_eq!(fmt_secs(1.5), "1.500");
        assert_eq!(fmt_secs(0.25), "0.250");
    }
}
