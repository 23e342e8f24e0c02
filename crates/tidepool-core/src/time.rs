//! Timestamp parsing and rendering.
//!
//! All timestamps are UTC milliseconds since the Unix epoch. Requests may
//! spell an instant in several ways; they all parse to the same value so
//! that equivalent requests share a fingerprint.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::{RequestError, RequestResult};

/// UTC milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// One second, in the unit used by [`EpochMillis`].
pub const MILLIS_PER_SECOND: i64 = 1_000;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a request timestamp.
///
/// Accepts RFC 3339, naive ISO-8601 date-times (interpreted as UTC) and
/// bare dates (midnight UTC).
pub fn parse_timestamp(input: &str) -> RequestResult<EpochMillis> {
    let s = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
        .ok_or_else(|| RequestError::InvalidTime(input.to_string()))
}

/// Render a timestamp the way result columns carry it:
/// `YYYY-MM-DD HH:MM:SS`, with a fractional part only when non-zero.
pub fn format_timestamp(millis: EpochMillis) -> String {
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        None => millis.to_string(),
    }
}

/// Current wall-clock time.
pub fn now_millis() -> EpochMillis {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_equivalent_spellings_to_same_instant() {
        let a = parse_timestamp("2019-06-01T00:00:00Z").unwrap();
        let b = parse_timestamp("2019-06-01T00:00:00").unwrap();
        let c = parse_timestamp("2019-06-01 00:00:00").unwrap();
        let d = parse_timestamp("2019-06-01").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(c, d);
        assert_eq!(a, 1_559_347_200_000);
    }

    #[test]
    fn parses_offsets_and_fractions() {
        let utc = parse_timestamp("2019-06-01T02:00:00.250+02:00").unwrap();
        assert_eq!(utc, 1_559_347_200_250);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            parse_timestamp("yesterday"),
            Err(RequestError::InvalidTime("yesterday".to_string()))
        );
    }

    #[test]
    fn formats_whole_and_fractional_seconds() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(1_559_347_200_250), "2019-06-01 00:00:00.250");
    }
}
