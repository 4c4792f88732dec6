//! Whitespace-separated (printer format) exports
//!
//! ```text
//! ; TRAX Apollyon event log
//! 2024-05-01 10:00:00   3
//! 2024-05-01T10:00:07Z  Count=1
//! ```

use super::{parse_count, timestamp::parse_timestamp, DialectParser, RecordIter};
use crate::error::{RecordFormatError, RowFault};
use chrono_tz::Tz;
use counterlink_common::types::VehiclePassageRecord;
use std::io::BufRead;

#[derive(Debug, Clone, Copy, Default)]
pub struct PrnDialect;

impl DialectParser for PrnDialect {
    fn records(&self, source: String, content: Vec<u8>, timezone: Tz) -> RecordIter {
        let lines = std::io::Cursor::new(content).split(b'\n');

        Box::new(lines.enumerate().filter_map(move |(index, line)| {
            let line_no = index as u64 + 1;
            let line = match line {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => return Some(Err(RecordFormatError::new(line_no, RowFault::Malformed(e.to_string())))),
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                return None;
            }

            Some(
                parse_line(line, timezone)
                    .map(|(timestamp, count)| VehiclePassageRecord::new(timestamp, count, source.clone()))
                    .map_err(|fault| RecordFormatError::new(line_no, fault)),
            )
        }))
    }

    fn name(&self) -> &'static str {
        "prn"
    }
}

fn parse_line(line: &str, timezone: Tz) -> Result<(chrono::DateTime<chrono::Utc>, u32), RowFault> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let first = tokens.first().copied().unwrap_or_default();

    match parse_timestamp(first, timezone) {
        Ok(timestamp) => Ok((timestamp, parse_count(tokens.iter().skip(1).copied())?)),
        Err(fault) => {
            let Some(second) = tokens.get(1) else {
                return Err(fault);
            };
            match parse_timestamp(&format!("{first} {second}"), timezone) {
                Ok(timestamp) => Ok((timestamp, parse_count(tokens.iter().skip(2).copied())?)),
                Err(_) => Err(fault),
            }
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn parse(content: &str, tz: Tz) -> Vec<Result<VehiclePassageRecord, RecordFormatError>> {
        PrnDialect
            .records("LOG.PRN".to_string(), content.as_bytes().to_vec(), tz)
            .collect()
    }

    #[test]
    fn test_columns_and_comments() {
        let rows = parse(
            "; TRAX Apollyon event log\r\n# site 12\r\n2024-05-01 10:00:00   3\r\n\r\n2024-05-01T10:00:07Z  Count=1\r\n2024/05/01 10:01:00\r\n",
            Tz::UTC,
        );

        let parsed: Vec<(String, u32)> = rows
            .iter()
            .map(|r| r.as_ref().map(|r| (r.iso_timestamp(), r.count)).unwrap())
            .collect();
        assert_eq!(
            parsed,
            vec![
                ("2024-05-01T10:00:00Z".to_string(), 3),
                ("2024-05-01T10:00:07Z".to_string(), 1),
                ("2024-05-01T10:01:00Z".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_local_time_and_bad_lines() {
        let rows = parse(
            "2024-01-15 09:00:00 2\n15.01.2024 09:00 2\n2024-01-15 09:30:00 two\n",
            chrono_tz::Europe::Paris,
        );

        assert_eq!(rows[0].as_ref().unwrap().iso_timestamp(), "2024-01-15T08:00:00Z");
        assert_eq!(
            rows[1],
            Err(RecordFormatError::new(2, RowFault::BadTimestamp("15.01.2024".to_string())))
        );
        assert_eq!(
            rows[2],
            Err(RecordFormatError::new(3, RowFault::BadCount("two".to_string())))
        );
    }
}
