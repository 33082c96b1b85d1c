//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC).

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

/// Convert Unix epoch milliseconds to `DateTime<Utc>`, clamping out-of-range values.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => {
            if ms.is_negative() {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            }
        }
    }
}

/// Whole seconds between two epoch-millisecond timestamps, or `None` when
/// either side was never set.
#[inline]
pub fn seconds_between(earlier_ms: i64, later_ms: i64) -> Option<i64> {
    if earlier_ms <= 0 || later_ms < earlier_ms {
        return None;
    }
    Some((later_ms - earlier_ms) / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_round_trip() {
        let now = Utc::now();
        let ms = datetime_to_ms(now);
        assert_eq!(ms_to_datetime(ms).timestamp_millis(), ms);
    }

    #[test]
    fn test_seconds_between() {
        assert_eq!(seconds_between(1_000, 61_000), Some(60));
        assert_eq!(seconds_between(0, 61_000), None);
        assert_eq!(seconds_between(61_000, 1_000), None);
    }
}
