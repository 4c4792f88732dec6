//! Record parser
//!
//! Turns the text of one export file into [`VehiclePassageRecord`]s. Each
//! export dialect has its own [`DialectParser`]; all of them yield a lazy
//! stream of per-row results so that a bad row costs one
//! [`RecordFormatError`] and nothing else.
//!
//! Parsing has no side effects. Asking for the records of the same file twice
//! produces the same sequence.

pub mod csv;
pub mod prn;
pub mod timestamp;

use crate::error::{ParseError, RecordFormatError, RowFault};
use crate::scanner::{ExportDialect, ExportFile};
use chrono_tz::Tz;
use counterlink_common::types::VehiclePassageRecord;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

pub use timestamp::parse_timestamp;

/// Per-row parse results, in file order
pub type RecordIter = Box<dyn Iterator<Item = Result<VehiclePassageRecord, RecordFormatError>> + Send>;

/// One export dialect
pub trait DialectParser: Send + Sync {
    /// Stream the rows of `content`, tagging records with `source`
    fn records(&self, source: String, content: Vec<u8>, timezone: Tz) -> RecordIter;

    /// Dialect name for logs
    fn name(&self) -> &'static str;
}

/// Everything one file produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedFile {
    pub records: Vec<VehiclePassageRecord>,
    #[serde(serialize_with = "serialize_rejected")]
    pub rejected: Vec<RecordFormatError>,
}

fn serialize_rejected<S: serde::Serializer>(
    rejected: &[RecordFormatError],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(rejected.iter().map(|e| e.to_string()))
}

/// Parses export files with a fixed source timezone
#[derive(Debug, Clone, Copy)]
pub struct RecordParser {
    timezone: Tz,
}

impl RecordParser {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    fn dialect_parser(dialect: ExportDialect) -> Result<&'static dyn DialectParser, ParseError> {
        match dialect {
            ExportDialect::Csv => Ok(&csv::CsvDialect),
            ExportDialect::Prn => Ok(&prn::PrnDialect),
            ExportDialect::Dump => Err(ParseError::UnsupportedDialect(dialect.as_str())),
        }
    }

    /// Lazily parse an export discovered by the scanner
    pub fn records(&self, file: &ExportFile) -> Result<RecordIter, ParseError> {
        let content = read(&file.path)?;
        self.records_from_bytes(file.dialect, &file.file_name, content)
    }

    /// Lazily parse export content that is already in memory
    pub fn records_from_bytes(
        &self,
        dialect: ExportDialect,
        source: &str,
        content: Vec<u8>,
    ) -> Result<RecordIter, ParseError> {
        let parser = Self::dialect_parser(dialect)?;
        debug!(file = source, dialect = parser.name(), bytes = content.len(), "Parsing export");
        Ok(parser.records(source.to_string(), content, self.timezone))
    }

    /// Parse an export to completion, separating records from rejected rows
    pub fn parse(&self, file: &ExportFile) -> Result<ParsedFile, ParseError> {
        Ok(collect(self.records(file)?))
    }

    /// Parse any file on disk, picking the dialect from its extension
    pub fn parse_path(&self, path: &Path) -> Result<ParsedFile, ParseError> {
        let dialect = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(|e| ExportDialect::from_extension(&e.to_lowercase()))
            .ok_or(ParseError::UnsupportedDialect("unknown"))?;
        let source = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let content = read(path)?;
        Ok(collect(self.records_from_bytes(dialect, &source, content)?))
    }
}

fn read(path: &Path) -> Result<Vec<u8>, ParseError> {
    std::fs::read(path).map_err(|source| ParseError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn collect(iter: RecordIter) -> ParsedFile {
    let mut parsed = ParsedFile::default();
    for row in iter {
        match row {
            Ok(record) => parsed.records.push(record),
            Err(e) => parsed.rejected.push(e),
        }
    }
    parsed
}

/// Count for one row: a `Count=N` field wins, then a bare number, then 1
pub(crate) fn parse_count<'a>(fields: impl Iterator<Item = &'a str>) -> Result<u32, RowFault> {
    let fields: Vec<&str> = fields.map(str::trim).filter(|f| !f.is_empty()).collect();

    if let Some(tagged) = fields.iter().find_map(|f| count_tag(f)) {
        return tagged.parse().map_err(|_| RowFault::BadCount(tagged.to_string()));
    }

    match fields.first() {
        Some(bare) => bare.parse().map_err(|_| RowFault::BadCount(bare.to_string())),
        None => Ok(1),
    }
}

fn count_tag(field: &str) -> Option<&str> {
    let (key, value) = field.split_once('=')?;
    key.trim().eq_ignore_ascii_case("count").then_some(value.trim())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn export(dir: &TempDir, name: &str, content: &str, dialect: ExportDialect) -> ExportFile {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        ExportFile {
            path,
            file_name: name.to_string(),
            size: content.len() as u64,
            modified: SystemTime::now(),
            dialect,
        }
    }

    #[test]
    fn test_one_good_row_one_bad_row() {
        let dir = TempDir::new().unwrap();
        let file = export(&dir, "A.CSV", "2024-05-01T10:00:00,3\nbad,row\n", ExportDialect::Csv);

        let parsed = RecordParser::new(Tz::UTC).parse(&file).unwrap();

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].iso_timestamp(), "2024-05-01T10:00:00Z");
        assert_eq!(parsed.records[0].count, 3);
        assert_eq!(parsed.records[0].source, "A.CSV");
        assert_eq!(parsed.rejected.len(), 1);
        assert_eq!(parsed.rejected[0].line, 2);
    }

    #[test]
    fn test_reparse_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let file = export(
            &dir,
            "B.PRN",
            "2024-05-01 10:00:00 2\nnonsense\n2024-05-01 10:05:00 4\n",
            ExportDialect::Prn,
        );
        let parser = RecordParser::new(chrono_tz::Europe::Berlin);

        let first: Vec<_> = parser.records(&file).unwrap().collect();
        let second: Vec<_> = parser.records(&file).unwrap().collect();

        assert_eq!(first, second);
        assert_eq!(first.iter().filter(|r| r.is_ok()).count(), 2);
        assert!(file.path.exists());
    }

    #[test]
    fn test_dump_dialect_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let file = export(&dir, "MEM.DMP", "\u{0}\u{1}", ExportDialect::Dump);

        let err = RecordParser::new(Tz::UTC).parse(&file).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedDialect("dmp")));
    }

    #[test]
    fn test_parse_path_picks_dialect_by_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trax_0001.prn");
        std::fs::write(&path, "; header\n2024-05-01T10:00:00Z Count=5\n").unwrap();

        let parsed = RecordParser::new(Tz::UTC).parse_path(&path).unwrap();
        assert_eq!(parsed.records[0].count, 5);
        assert_eq!(parsed.records[0].source, "trax_0001.prn");

        let unknown = dir.path().join("readme.txt");
        std::fs::write(&unknown, "hi").unwrap();
        assert!(RecordParser::new(Tz::UTC).parse_path(&unknown).is_err());
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count(std::iter::empty()), Ok(1));
        assert_eq!(parse_count(["07"].into_iter()), Ok(7));
        assert_eq!(parse_count(["Lane1", "Count=2"].into_iter()), Ok(2));
        assert_eq!(parse_count(["", " "].into_iter()), Ok(1));
        assert_eq!(parse_count(["-3"].into_iter()), Err(RowFault::BadCount("-3".to_string())));
        assert_eq!(
            parse_count(["count=many"].into_iter()),
            Err(RowFault::BadCount("many".to_string()))
        );
    }
}
