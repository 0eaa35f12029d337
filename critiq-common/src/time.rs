//! Timestamp utilities

use chrono::{DateTime, SecondsFormat, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// RFC 3339 rendering with millisecond precision, used in manifests and traces
pub fn to_rfc3339_millis(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        // Should be a reasonable timestamp (after year 2000)
        assert!(timestamp.timestamp() > 946_684_800);
    }

    #[test]
    fn test_millis_to_duration() {
        assert_eq!(millis_to_duration(0), Duration::from_millis(0));
        assert_eq!(millis_to_duration(1500).as_secs_f64(), 1.5);
    }

    #[test]
    fn test_rfc3339_millis_uses_z_suffix() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T10:20:30.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(to_rfc3339_millis(&ts), "2024-03-01T10:20:30.123Z");
    }
}
