//! Timestamp helpers for the database layer.
//!
//! All persisted timestamps are `INTEGER` Unix epoch milliseconds (UTC).
//! Schedule math happens on `DateTime<Utc>` values and converts at the
//! storage boundary.

use chrono::{DateTime, TimeZone, Utc};

/// Current time as Unix epoch milliseconds (UTC).
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a `DateTime<Utc>` to Unix epoch milliseconds.
#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
///
/// Values outside chrono's representable range clamp to the nearest
/// representable timestamp instead of panicking.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    if let Some(dt) = Utc.timestamp_millis_opt(ms).single() {
        return dt;
    }
    let clamped = if ms < 0 {
        Utc.timestamp_millis_opt(i64::MIN).earliest()
    } else {
        Utc.timestamp_millis_opt(i64::MAX).latest()
    };
    clamped.unwrap_or_else(Utc::now)
}
