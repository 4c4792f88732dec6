//! Timestamp normalization
//!
//! Counters write local wall-clock time in a handful of layouts. Everything
//! is converted to UTC at second precision here.

use crate::error::RowFault;
use chrono::{DateTime, Datelike, LocalResult, NaiveDateTime, SubsecRound, TimeZone, Utc};
use chrono_tz::Tz;
use std::ops::RangeInclusive;

/// Years a counter clock can plausibly report
pub const VALID_YEARS: RangeInclusive<i32> = 2000..=2099;

/// Naive layouts, tried in order. `%.f` also matches when no fraction is present.
const NAIVE_FORMATS: &[&str] = &[
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S%.f",
    "%Y/%m/%d %H:%M",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
];

/// Parse one timestamp field, interpreting naive times in `tz`
pub fn parse_timestamp(raw: &str, tz: Tz) -> Result<DateTime<Utc>, RowFault> {
    let raw = raw.trim().trim_matches('"').trim();
    if raw.is_empty() {
        return Err(RowFault::MissingTimestamp);
    }

    let utc = if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        check_year(with_offset.year())?;
        with_offset.with_timezone(&Utc)
    } else {
        let naive = NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .ok_or_else(|| RowFault::BadTimestamp(raw.to_string()))?;
        check_year(naive.year())?;
        localize(naive, tz, raw)?
    };

    Ok(utc.trunc_subsecs(0))
}

fn check_year(year: i32) -> Result<(), RowFault> {
    if VALID_YEARS.contains(&year) {
        Ok(())
    } else {
        Err(RowFault::OutOfRange(year))
    }
}

fn localize(naive: NaiveDateTime, tz: Tz, raw: &str) -> Result<DateTime<Utc>, RowFault> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(local) => Ok(local.with_timezone(&Utc)),
        // Repeated hour at the end of DST: take the first occurrence.
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(RowFault::NonexistentLocalTime(raw.to_string())),
    }
}
