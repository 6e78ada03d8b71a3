//! Duration strings used throughout `tune.toml`.

use std::time::Duration;

/// Parse a duration string like "5s", "500ms", "2m", "24h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        scaled(mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        scaled(hours, 3600)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// `n * unit` seconds; `None` on overflow.
fn scaled(n: &str, unit: u64) -> Option<Duration> {
    n.trim()
        .parse::<u64>()
        .ok()?
        .checked_mul(unit)
        .map(Duration::from_secs)
}

/// Parse `s`, falling back to `default` when it is malformed.
pub fn parse_or(s: &str, default: Duration) -> Duration {
    parse_duration(s).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_and_millis() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
    }

    #[test]
    fn minutes_and_hours() {
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("24h"), Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn overflowing_units_are_rejected() {
        assert_eq!(parse_duration("18446744073709551615m"), None);
        assert_eq!(parse_duration("9999999999999999h"), None);
        assert_eq!(parse_or("9999999999999999h", Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn plain_number_is_seconds() {
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
    }

    #[test]
    fn garbage_falls_back() {
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_or("soon", Duration::from_secs(2)), Duration::from_secs(2));
    }
}
