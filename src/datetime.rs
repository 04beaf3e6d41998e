//! Date-time parsing for query ranges and bucketing steps.
//!
//! Timestamps are parsed from ISO-8601 strings (basic `20150101T000000` and
//! extended `2015-01-01T00:00:00` forms, optionally with a fractional part)
//! and converted into the 10 ns tick domain. All conversions are checked;
//! out-of-range values surface as [`Error::Overflow`].

use crate::error::{Error, Result};
use crate::types::{Timestamp, TsDuration, TICKS_PER_SEC};
use chrono::NaiveDateTime;

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y%m%dT%H%M%S%.f",
    "%Y%m%dT%H%M%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
];

/// Parses an ISO-8601 date-time string into 10 ns ticks since the epoch.
/// The input is interpreted as UTC.
pub fn from_iso_string(text: &str) -> Result<Timestamp> {
    let text = text.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(text, format) {
            return ticks_from_datetime(datetime);
        }
    }
    Err(Error::QueryParsing(format!(
        "can't parse timestamp `{text}`"
    )))
}

fn ticks_from_datetime(datetime: NaiveDateTime) -> Result<Timestamp> {
    let utc = datetime.and_utc();
    let seconds = utc.timestamp();
    if seconds < 0 {
        return Err(Error::Overflow(format!(
            "timestamp `{datetime}` is before the epoch"
        )));
    }
    let subsec_ticks = u64::from(utc.timestamp_subsec_nanos()) / 10;
    (seconds as u64)
        .checked_mul(TICKS_PER_SEC)
        .and_then(|ticks| ticks.checked_add(subsec_ticks))
        .ok_or_else(|| Error::Overflow(format!("timestamp `{datetime}` is out of range")))
}

/// Parses a duration of the form `<digits><unit>` into 10 ns ticks.
///
/// Recognized units: `ns`, `us`, `ms`, `s`/`sec`, `m`/`min`, `h`. A bare
/// number is nanoseconds; sub-tick remainders truncate toward zero.
pub fn parse_duration(text: &str) -> Result<TsDuration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    if digits.is_empty() {
        return Err(Error::QueryParsing(format!(
            "can't parse duration `{text}`"
        )));
    }
    let count: u64 = digits
        .parse()
        .map_err(|_| Error::QueryParsing(format!("can't parse duration `{text}`")))?;
    let ticks_per_unit = match unit {
        "" | "n" | "ns" => return Ok(count / 10),
        "us" => 100,
        "ms" => 100_000,
        "s" | "sec" => TICKS_PER_SEC,
        "m" | "min" => 60 * TICKS_PER_SEC,
        "h" => 3600 * TICKS_PER_SEC,
        _ => {
            return Err(Error::QueryParsing(format!(
                "unknown duration suffix `{unit}`"
            )))
        }
    };
    count
        .checked_mul(ticks_per_unit)
        .ok_or_else(|| Error::Overflow(format!("duration `{text}` is out of range")))
}
