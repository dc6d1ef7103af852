//! Timing header codec.
//!
//! Marks are local wall-clock date-times rendered as
//! `yyyy-MM-ddTHH:mm:ss.nnnnnnnnn` (always nine fractional digits), e.g.
//! `2024-03-09T14:07:21.026490708`.
//!
//! # Design Decisions
//! - Local system zone, no offset in the text: marks from different hosts
//!   only compare meaningfully when their clocks agree
//! - Latency is clamped at zero so skew never yields a negative header
//! - Absent start mark means "started now" (zero), malformed start mark is
//!   an error the caller downgrades to "header omitted"

use std::fmt;
use std::str::FromStr;

use chrono::{Local, NaiveDateTime};
use thiserror::Error;

/// `strftime` pattern of the wire format.
pub const PATTERN: &str = "%Y-%m-%dT%H:%M:%S%.9f";

const FRACTION_DIGITS: usize = 9;

/// Errors decoding a timing header.
#[derive(Debug, Error)]
pub enum TimestampParseError {
    #[error("timestamp `{0}` must end with a nine-digit fraction")]
    Fraction(String),

    #[error("timestamp `{text}` is not a valid date-time: {source}")]
    Pattern {
        text: String,
        source: chrono::ParseError,
    },
}

/// A point in local wall-clock time, as carried in timing headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimestampMark(NaiveDateTime);

impl TimestampMark {
    /// Capture the current local time.
    pub fn now() -> Self {
        Self(Local::now().naive_local())
    }

    pub fn from_naive(value: NaiveDateTime) -> Self {
        Self(value)
    }

    pub fn as_naive(&self) -> NaiveDateTime {
        self.0
    }

    /// Render in the wire format.
    pub fn encode(&self) -> String {
        self.0.format(PATTERN).to_string()
    }

    /// Parse the wire format.
    pub fn decode(text: &str) -> Result<Self, TimestampParseError> {
        let fraction_ok = text
            .rsplit_once('.')
            .map(|(_, frac)| {
                frac.len() == FRACTION_DIGITS && frac.bytes().all(|b| b.is_ascii_digit())
            })
            .unwrap_or(false);
        if !fraction_ok {
            return Err(TimestampParseError::Fraction(text.to_string()));
        }

        NaiveDateTime::parse_from_str(text, PATTERN)
            .map(Self)
            .map_err(|source| TimestampParseError::Pattern {
                text: text.to_string(),
                source,
            })
    }

    /// Whole milliseconds from `self` to `end`, zero if `end` is earlier.
    pub fn millis_until(&self, end: TimestampMark) -> u64 {
        let millis = (end.0 - self.0).num_milliseconds();
        u64::try_from(millis).unwrap_or(0)
    }
}

impl fmt::Display for TimestampMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(PATTERN))
    }
}

impl FromStr for TimestampMark {
    type Err = TimestampParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Milliseconds between an encoded start mark and `end`.
///
/// A missing start is treated as `end` itself, giving zero.
pub fn delta_millis(start: Option<&str>, end: TimestampMark) -> Result<u64, TimestampParseError> {
    match start {
        Some(text) => Ok(TimestampMark::decode(text)?.millis_until(end)),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn mark(h: u32, m: u32, s: u32, nanos: u32) -> TimestampMark {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|d| d.and_hms_nano_opt(h, m, s, nanos))
            .unwrap();
        TimestampMark::from_naive(dt)
    }

    #[test]
    fn test_encode_uses_nine_fraction_digits() {
        assert_eq!(mark(14, 7, 21, 26_490_708).encode(), "2024-03-09T14:07:21.026490708");
        assert_eq!(mark(0, 0, 0, 0).encode(), "2024-03-09T00:00:00.000000000");
    }

    #[test]
    fn test_round_trip() {
        for t in [mark(14, 7, 21, 26_490_708), mark(23, 59, 59, 999_999_999), TimestampMark::now()] {
            assert_eq!(TimestampMark::decode(&t.encode()).unwrap(), t);
        }
    }

    #[test]
    fn test_decode_rejects_other_shapes() {
        for text in [
            "",
            "not a time",
            "2024-03-09T14:07:21",
            "2024-03-09T14:07:21.026",
            "2024-03-09T14:07:21.0264907081",
            "2024-03-09 14:07:21.026490708",
            "2024-13-09T14:07:21.026490708",
        ] {
            assert!(TimestampMark::decode(text).is_err(), "accepted {text:?}");
        }
    }

    #[test]
    fn test_delta_millis() {
        let start = mark(10, 0, 0, 0).encode();
        let end = mark(10, 0, 1, 250_000_000);
        assert_eq!(delta_millis(Some(&start), end).unwrap(), 1250);
    }

    #[test]
    fn test_delta_without_start_is_zero() {
        assert_eq!(delta_millis(None, TimestampMark::now()).unwrap(), 0);
    }

    #[test]
    fn test_delta_with_malformed_start_is_error() {
        assert!(delta_millis(Some("yesterday"), TimestampMark::now()).is_err());
    }

    #[test]
    fn test_delta_clamps_when_end_precedes_start() {
        let start = mark(10, 0, 5, 0).encode();
        assert_eq!(delta_millis(Some(&start), mark(10, 0, 0, 0)).unwrap(), 0);
    }
}
