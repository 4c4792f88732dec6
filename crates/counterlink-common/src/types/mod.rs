//! Common types used across Counterlink

pub mod payload;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifier of the roadside location a counter is installed at.
///
/// Assigned ahead of deployment (0 for location A, 1 for location B, ...).
pub type LocationId = u32;

// ============================================================================
// Records
// ============================================================================

/// One parsed row of a counter export.
///
/// Timestamps are stored in UTC at whole-second precision; anything finer is
/// dropped on construction so that a record survives the wire format intact.
///
/// # Examples
///
/// ```rust,ignore
/// use counterlink_common::types::VehiclePassageRecord;
///
/// let record = VehiclePassageRecord::new(
///     "2024-05-01T10:00:00Z".parse().unwrap(),
///     3,
///     "TRAX_20240501_0001.CSV",
/// );
/// assert_eq!(record.iso_timestamp(), "2024-05-01T10:00:00Z");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VehiclePassageRecord {
    /// Passage (or interval end) time, UTC, second precision
    pub timestamp: DateTime<Utc>,

    /// Number of vehicles; 1 for per-vehicle event rows
    pub count: u32,

    /// Name of the export file the row came from
    pub source: String,
}

impl VehiclePassageRecord {
    /// Create a record, truncating the timestamp to whole seconds
    pub fn new(timestamp: DateTime<Utc>, count: u32, source: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.trunc_subsecs(0),
            count,
            source: source.into(),
        }
    }

    /// ISO-8601 rendering used on the wire (`YYYY-MM-DDTHH:MM:SSZ`)
    pub fn iso_timestamp(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

// ============================================================================
// Batches
// ============================================================================

/// One transmission unit: every record gathered during a poll cycle.
///
/// Records are kept in file order, then row order. Each record names its
/// source file, which is what lets a partial acknowledgment be mapped back to
/// the files that may be cleaned up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Random id, reused when an unacknowledged batch is resent unchanged
    pub batch_id: Uuid,

    /// Location the counter is installed at
    pub location_id: LocationId,

    /// When the batch was assembled, UTC, second precision
    pub created_at: DateTime<Utc>,

    /// Records in transmission order
    pub records: Vec<VehiclePassageRecord>,
}

impl Batch {
    /// Create a batch with a fresh id
    pub fn new(
        location_id: LocationId,
        created_at: DateTime<Utc>,
        records: Vec<VehiclePassageRecord>,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), location_id, created_at, records)
    }

    /// Create a batch with a caller-chosen id
    pub fn with_id(
        batch_id: Uuid,
        location_id: LocationId,
        created_at: DateTime<Utc>,
        records: Vec<VehiclePassageRecord>,
    ) -> Self {
        Self {
            batch_id,
            location_id,
            created_at: created_at.trunc_subsecs(0),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of all record counts
    pub fn vehicle_total(&self) -> u64 {
        self.records.iter().map(|r| u64::from(r.count)).sum()
    }

    /// Distinct source files, in first-seen order
    pub fn source_files(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for record in &self.records {
            if !seen.contains(&record.source.as_str()) {
                seen.push(record.source.as_str());
            }
        }
        seen
    }

    /// Number of records contributed by each source file
    pub fn records_per_file(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.source.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_record_truncates_subseconds() {
        let precise = at(10, 0, 0) + chrono::Duration::milliseconds(750);
        let record = VehiclePassageRecord::new(precise, 1, "A.CSV");

        assert_eq!(record.timestamp, at(10, 0, 0));
        assert_eq!(record.iso_timestamp(), "2024-05-01T10:00:00Z");
    }

    #[test]
    fn test_batch_provenance() {
        let batch = Batch::new(
            3,
            at(12, 0, 0),
            vec![
                VehiclePassageRecord::new(at(10, 0, 0), 3, "B.CSV"),
                VehiclePassageRecord::new(at(10, 5, 0), 1, "B.CSV"),
                VehiclePassageRecord::new(at(11, 0, 0), 2, "A.CSV"),
            ],
        );

        assert_eq!(batch.source_files(), vec!["B.CSV", "A.CSV"]);
        assert_eq!(batch.records_per_file().get("B.CSV"), Some(&2));
        assert_eq!(batch.vehicle_total(), 6);
        assert_eq!(batch.len(), 3);
    }
}
