//! Batch builder
//!
//! Gathers the records parsed in one cycle into a single [`Batch`] and
//! compresses it. The builder also decides the batch identity: an unchanged
//! set of files that failed to upload last cycle is resent under the same id
//! and creation time, so the server sees a byte-identical payload and can drop
//! the duplicate.
//!
//! The compressed payload must fit under a byte ceiling (what is left of the
//! monthly budget). Whole files are taken in scan order; a file that would
//! push the payload over the ceiling is deferred and later files still get
//! their chance.

use crate::scanner::ExportFile;
use chrono::{DateTime, Utc};
use counterlink_common::types::{payload, Batch, LocationId, VehiclePassageRecord};
use counterlink_common::CounterlinkError;
use uuid::Uuid;

/// A batch, its compressed payload and the files it was built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBatch {
    pub batch: Batch,
    /// Contributing files, in batch order
    pub files: Vec<ExportFile>,
    /// Gzip body as sent to the server
    pub payload: Vec<u8>,
}

impl PreparedBatch {
    /// Whether `files` are exactly the file versions this batch was built from
    fn same_files(&self, files: &[&ExportFile]) -> bool {
        self.files.len() == files.len()
            && self.files.iter().zip(files).all(|(a, b)| {
                a.file_name == b.file_name && a.size == b.size && a.modified == b.modified
            })
    }

    fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// What one cycle's records turned into
#[derive(Debug, Default)]
pub struct BatchPlan {
    /// The batch to send, if any file fits under the ceiling
    pub prepared: Option<PreparedBatch>,
    /// Files with records that did not fit; they stay unseen
    pub deferred: Vec<ExportFile>,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchBuilder {
    location_id: LocationId,
}

impl BatchBuilder {
    pub fn new(location_id: LocationId) -> Self {
        Self { location_id }
    }

    /// Build this cycle's batch with a payload of at most `ceiling` bytes.
    ///
    /// Files without records are left out.
    pub fn build(
        &self,
        parsed: Vec<(ExportFile, Vec<VehiclePassageRecord>)>,
        now: DateTime<Utc>,
        previous: Option<&PreparedBatch>,
        ceiling: u64,
    ) -> Result<BatchPlan, CounterlinkError> {
        let candidates: Vec<_> = parsed.into_iter().filter(|(_, r)| !r.is_empty()).collect();
        if candidates.is_empty() {
            return Ok(BatchPlan::default());
        }

        let everything = self.assemble(candidates.iter(), now, previous)?;
        if everything.payload_len() <= ceiling {
            return Ok(BatchPlan {
                prepared: Some(everything),
                deferred: Vec::new(),
            });
        }

        let mut chosen: Vec<&(ExportFile, Vec<VehiclePassageRecord>)> = Vec::new();
        let mut prepared = None;
        let mut deferred = Vec::new();
        for candidate in &candidates {
            chosen.push(candidate);
            let trial = self.assemble(chosen.iter().copied(), now, previous)?;
            if trial.payload_len() <= ceiling {
                prepared = Some(trial);
            } else {
                chosen.pop();
                deferred.push(candidate.0.clone());
            }
        }

        Ok(BatchPlan { prepared, deferred })
    }

    fn assemble<'a>(
        &self,
        parts: impl Iterator<Item = &'a (ExportFile, Vec<VehiclePassageRecord>)>,
        now: DateTime<Utc>,
        previous: Option<&PreparedBatch>,
    ) -> Result<PreparedBatch, CounterlinkError> {
        let mut files = Vec::new();
        let mut records = Vec::new();
        for (file, file_records) in parts {
            files.push(file);
            records.extend(file_records.iter().cloned());
        }

        let (batch_id, created_at) = match previous {
            Some(prev) if prev.same_files(&files) => (prev.batch.batch_id, prev.batch.created_at),
            _ => (Uuid::new_v4(), now),
        };
        let batch = Batch::with_id(batch_id, self.location_id, created_at, records);
        let payload = payload::compress(&batch)?;

        Ok(PreparedBatch {
            batch,
            files: files.into_iter().cloned().collect(),
            payload,
        })
    }
}
