//! Millisecond day-bucket arithmetic
//!
//! Samples are routed per UTC day. A day is the integer obtained by
//! dividing a millisecond Unix timestamp by 86,400,000; negative
//! timestamps round toward negative infinity so a timestamp just before
//! the epoch lands in day -1, not day 0.

/// Milliseconds in one day
pub const MILLIS_PER_DAY: i64 = 86_400_000;

/// Day bucket containing the given millisecond timestamp
pub fn day_of(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(MILLIS_PER_DAY)
}

/// All day buckets touched by the inclusive time span `[mint, maxt]`
pub fn days_in_span(mint: i64, maxt: i64) -> Vec<i64> {
    if maxt < mint {
        return Vec::new();
    }
    (day_of(mint)..=day_of(maxt)).collect()
}

/// Current wall-clock time as a millisecond Unix timestamp
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
