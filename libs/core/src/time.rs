use chrono::{SecondsFormat, Utc};

/// Current wall-clock time as fractional Unix seconds (microsecond precision).
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Current wall-clock time as an RFC 3339 string in UTC.
pub fn rfc3339_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
