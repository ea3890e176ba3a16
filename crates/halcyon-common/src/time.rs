//! Lenient timestamp parsing for vendor payloads
//!
//! Vendor objects carry their time in many shapes: epoch seconds, epoch
//! milliseconds, RFC 3339 strings, or naive date-times without an offset.
//! Naive values are interpreted as UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Epoch values above this are treated as milliseconds (about year 2286 in seconds).
pub const MILLIS_THRESHOLD: f64 = 10_000_000_000.0;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%z"];

/// Parse a JSON value into a UTC timestamp, if it looks like one.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

/// Parse a string timestamp (epoch digits, RFC 3339, or naive UTC).
pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<f64>().ok().and_then(from_epoch);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Convert an epoch number (seconds or milliseconds) into a timestamp.
///
/// Zero, negative and non-finite values are rejected.
pub fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let secs = if value > MILLIS_THRESHOLD {
        value / 1000.0
    } else {
        value
    };
    let whole = secs.trunc();
    let nanos = ((secs - whole) * 1_000_000_000.0).round() as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_epoch_seconds_and_millis() {
        let expected = ts("2024-03-01T00:00:00Z");
        assert_eq!(parse_timestamp(&json!(1_709_251_200)), Some(expected));
        assert_eq!(parse_timestamp(&json!(1_709_251_200_000_i64)), Some(expected));
        assert_eq!(parse_timestamp(&json!("1709251200")), Some(expected));
    }

    #[test]
    fn test_rfc3339_with_z_and_offset() {
        assert_eq!(
            parse_timestamp(&json!("2024-03-01T10:00:00Z")),
            Some(ts("2024-03-01T10:00:00Z"))
        );
        assert_eq!(
            parse_timestamp(&json!("2024-03-01T12:00:00+02:00")),
            Some(ts("2024-03-01T10:00:00Z"))
        );
    }

    #[test]
    fn test_naive_formats_are_utc() {
        assert_eq!(
            parse_timestamp(&json!("2024-03-01 10:00:00")),
            Some(ts("2024-03-01T10:00:00Z"))
        );
        assert_eq!(
            parse_timestamp(&json!("2024-03-01T10:00:00.250")),
            Some(ts("2024-03-01T10:00:00.250Z"))
        );
        assert_eq!(
            parse_timestamp(&json!("2024-03-01")),
            Some(ts("2024-03-01T00:00:00Z"))
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_timestamp(&json!(null)), None);
        assert_eq!(parse_timestamp(&json!(0)), None);
        assert_eq!(parse_timestamp(&json!(-5)), None);
        assert_eq!(parse_timestamp(&json!("   ")), None);
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!({"t": 1})), None);
    }
}
