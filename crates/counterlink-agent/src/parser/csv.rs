//! Comma-separated exports
//!
//! ```text
//! TRAX Apollyon GPS  Site 0412        <- optional preamble
//! TimeStamp,Count,Lane                <- header, skipped with everything above
//! 2024/05/01 10:00:00,3,1
//! 2024/05/01 10:00:07,Count=1
//! ```
//!
//! Exports whose header names separate `Date` and `Time` columns put the two
//! halves of the timestamp in the first two fields; the count then follows.

use super::{parse_count, timestamp::parse_timestamp, DialectParser, RecordIter};
use crate::error::{RecordFormatError, RowFault};
use ::csv::{ReaderBuilder, StringRecord, Trim};
use chrono_tz::Tz;
use counterlink_common::types::VehiclePassageRecord;

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvDialect;

impl DialectParser for CsvDialect {
    fn records(&self, source: String, content: Vec<u8>, timezone: Tz) -> RecordIter {
        let (body_start, lines_skipped) = find_body(&content);
        let body = content[body_start..].to_vec();

        let reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(std::io::Cursor::new(body));

        Box::new(reader.into_records().filter_map(move |row| {
            let (line, row) = match row {
                Ok(row) => (row.position().map_or(0, |p| p.line()) + lines_skipped, row),
                Err(e) => {
                    let line = e.position().map_or(0, |p| p.line()) + lines_skipped;
                    return Some(Err(RecordFormatError::new(line, RowFault::Malformed(e.to_string()))));
                },
            };
            if row.iter().all(str::is_empty) {
                return None;
            }
            Some(
                parse_row(&row, timezone)
                    .map(|(timestamp, count)| VehiclePassageRecord::new(timestamp, count, source.clone()))
                    .map_err(|fault| RecordFormatError::new(line, fault)),
            )
        }))
    }

    fn name(&self) -> &'static str {
        "csv"
    }
}

fn parse_row(row: &StringRecord, timezone: Tz) -> Result<(chrono::DateTime<chrono::Utc>, u32), RowFault> {
    let first = row.get(0).unwrap_or_default();

    match parse_timestamp(first, timezone) {
        Ok(timestamp) => Ok((timestamp, parse_count(row.iter().skip(1))?)),
        Err(fault) => {
            // Separate date and time columns.
            let Some(second) = row.get(1).filter(|s| !s.is_empty()) else {
                return Err(fault);
            };
            let joined = format!("{first} {second}");
            match parse_timestamp(&joined, timezone) {
                Ok(timestamp) => Ok((timestamp, parse_count(row.iter().skip(2))?)),
                Err(_) => Err(fault),
            }
        },
    }
}

/// Byte offset of the first data line and the number of lines before it.
///
/// The header is the first line with a `TimeStamp` column, or with both a
/// `Date` and a `Time` column. Without one, the whole file is data.
fn find_body(content: &[u8]) -> (usize, u64) {
    let mut offset = 0;
    for (index, line) in content.split_inclusive(|b| *b == b'\n').enumerate() {
        if is_header(&String::from_utf8_lossy(line)) {
            return (offset + line.len(), index as u64 + 1);
        }
        offset += line.len();
    }
    (0, 0)
}

/// Whole-word match, so preamble text like "Last update time" is not a header
fn is_header(line: &str) -> bool {
    let tokens: Vec<String> = line
        .split(|c: char| matches!(c, ',' | ';' | '/') || c.is_whitespace())
        .map(|t| t.trim_matches('"').to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    let has = |name: &str| tokens.iter().any(|t| t == name);

    has("timestamp") || (has("date") && has("time"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Vec<Result<VehiclePassageRecord, RecordFormatError>> {
        CsvDialect
            .records("T.CSV".to_string(), content.as_bytes().to_vec(), Tz::UTC)
            .collect()
    }

    fn iso_and_count(rows: &[Result<VehiclePassageRecord, RecordFormatError>]) -> Vec<(String, u32)> {
        rows.iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|r| (r.iso_timestamp(), r.count))
            .collect()
    }

    #[test]
    fn test_preamble_and_header_are_skipped() {
        let rows = parse(
            "TRAX Apollyon Site 0412\nFirmware 2.1\nTimeStamp,Count,Lane\n\
             2024/05/01 10:00:00,3,1\n2024/05/01 10:00:07,Count=1\n",
        );

        assert_eq!(
            iso_and_count(&rows),
            vec![
                ("2024-05-01T10:00:00Z".to_string(), 3),
                ("2024-05-01T10:00:07Z".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_preamble_words_do_not_look_like_a_header() {
        let rows = parse(
            "Last update time 2024-05-01\r\nValidated data\r\nTimeStamp,Count\r\n2024-05-01 10:00:00,2\r\n",
        );

        assert!(rows.iter().all(|r| r.is_ok()));
        assert_eq!(iso_and_count(&rows), vec![("2024-05-01T10:00:00Z".to_string(), 2)]);
        assert!(is_header("\"Date\";\"Time\";\"Count\""));
        assert!(is_header("Date/Time,Count"));
        assert!(!is_header("Updated at time of export"));
    }

    #[test]
    fn test_rejected_rows_report_file_line_numbers() {
        let rows = parse("TimeStamp,Count\n2024-05-01T10:00:00,2\n\n1998-01-01 00:00:00,1\n2024-05-01T10:01:00,x\n");

        let errors: Vec<_> = rows.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], &RecordFormatError::new(4, RowFault::OutOfRange(1998)));
        assert_eq!(errors[1], &RecordFormatError::new(5, RowFault::BadCount("x".to_string())));
    }

    #[test]
    fn test_separate_date_and_time_columns() {
        let rows = parse("Date,Time,Count\n05/01/2024,10:00:00,4\n05/01/2024,10:02:30\n");

        assert_eq!(
            iso_and_count(&rows),
            vec![
                ("2024-05-01T10:00:00Z".to_string(), 4),
                ("2024-05-01T10:02:30Z".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_single_column_rows_count_one_vehicle() {
        let rows = parse("\"2024-05-01 10:00:00\"\n2024-05-01 10:00:05\n");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.as_ref().map(|r| r.count == 1).unwrap_or(false)));
    }
}
