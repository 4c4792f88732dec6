//! Compact wire payload for batches
//!
//! Every byte crosses a metered cellular link, so a batch is written as JSON
//! with one-letter keys and no whitespace, records are grouped under their
//! file name instead of repeating it, and the result is gzipped:
//!
//! ```json
//! {"l":3,"b":"6c1f…","c":"2026-10-19T12:00:00Z",
//!  "f":[{"n":"TRAX_0001.CSV","r":[["2024-05-01T10:00:00Z",3]]}]}
//! ```
//!
//! Encoding is deterministic: the gzip header carries no timestamp or file
//! name and the compression level is fixed, so the same batch always yields
//! the same bytes.

use super::{Batch, LocationId, VehiclePassageRecord};
use crate::error::{CounterlinkError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use uuid::Uuid;

/// Upper bound on a decompressed payload.
pub const MAX_DECOMPRESSED_BYTES: u64 = 64 * 1024 * 1024;

/// gzip level used for every payload
const PAYLOAD_COMPRESSION: u32 = 9;

#[derive(Debug, Serialize, Deserialize)]
struct WireBatch {
    #[serde(rename = "l")]
    location: LocationId,
    #[serde(rename = "b")]
    batch_id: Uuid,
    #[serde(rename = "c")]
    created_at: String,
    #[serde(rename = "f")]
    files: Vec<WireFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFile {
    #[serde(rename = "n")]
    name: String,
    #[serde(rename = "r")]
    records: Vec<(String, u32)>,
}

fn iso(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_iso(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| CounterlinkError::InvalidPayload(format!("bad timestamp '{raw}': {e}")))
}

impl From<&Batch> for WireBatch {
    fn from(batch: &Batch) -> Self {
        // Consecutive records from the same file share one group.
        let mut files: Vec<WireFile> = Vec::new();
        for record in &batch.records {
            let entry = (record.iso_timestamp(), record.count);
            match files.last_mut() {
                Some(group) if group.name == record.source => group.records.push(entry),
                _ => files.push(WireFile {
                    name: record.source.clone(),
                    records: vec![entry],
                }),
            }
        }

        Self {
            location: batch.location_id,
            batch_id: batch.batch_id,
            created_at: iso(&batch.created_at),
            files,
        }
    }
}

impl TryFrom<WireBatch> for Batch {
    type Error = CounterlinkError;

    fn try_from(wire: WireBatch) -> Result<Self> {
        let mut records = Vec::new();
        for file in wire.files {
            for (ts, count) in file.records {
                records.push(VehiclePassageRecord::new(parse_iso(&ts)?, count, file.name.clone()));
            }
        }

        Ok(Batch::with_id(wire.batch_id, wire.location, parse_iso(&wire.created_at)?, records))
    }
}

/// Serialize a batch to compact JSON (before compression)
pub fn encode(batch: &Batch) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&WireBatch::from(batch))?)
}

/// Parse compact JSON back into a batch
pub fn decode(json: &[u8]) -> Result<Batch> {
    let wire: WireBatch = serde_json::from_slice(json)?;
    Batch::try_from(wire)
}

/// Encode and gzip a batch into an upload payload
pub fn compress(batch: &Batch) -> Result<Vec<u8>> {
    let json = encode(batch)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::new(PAYLOAD_COMPRESSION));
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Gunzip and decode an upload payload
pub fn decompress(payload: &[u8]) -> Result<Batch> {
    let mut json = Vec::new();
    GzDecoder::new(payload)
        .take(MAX_DECOMPRESSED_BYTES + 1)
        .read_to_end(&mut json)?;

    if json.len() as u64 > MAX_DECOMPRESSED_BYTES {
        return Err(CounterlinkError::InvalidPayload(format!(
            "decompressed payload exceeds {MAX_DECOMPRESSED_BYTES} bytes"
        )));
    }

    decode(&json)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn sample_batch() -> Batch {
        let t = |m: u32| Utc.with_ymd_and_hms(2024, 5, 1, 10, m, 0).unwrap();
        Batch::with_id(
            Uuid::nil(),
            3,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            vec![
                VehiclePassageRecord::new(t(0), 3, "A.CSV"),
                VehiclePassageRecord::new(t(1), 1, "A.CSV"),
                VehiclePassageRecord::new(t(2), 7, "B.PRN"),
            ],
        )
    }

    #[test]
    fn test_encode_uses_short_keys_and_groups_by_file() {
        let json = String::from_utf8(encode(&sample_batch()).unwrap()).unwrap();

        assert_eq!(
            json,
            concat!(
                r#"{"l":3,"b":"00000000-0000-0000-0000-000000000000","c":"2024-05-01T12:00:00Z","#,
                r#""f":[{"n":"A.CSV","r":[["2024-05-01T10:00:00Z",3],["2024-05-01T10:01:00Z",1]]},"#,
                r#"{"n":"B.PRN","r":[["2024-05-01T10:02:00Z",7]]}]}"#
            )
        );
    }

    #[test]
    fn test_compress_is_deterministic() {
        let batch = sample_batch();
        assert_eq!(compress(&batch).unwrap(), compress(&batch).unwrap());
    }

    #[test]
    fn test_interleaved_sources_keep_order() {
        let mut batch = sample_batch();
        let back_to_a = VehiclePassageRecord::new(batch.records[0].timestamp, 9, "A.CSV");
        batch.records.push(back_to_a);

        assert_eq!(decompress(&compress(&batch).unwrap()).unwrap(), batch);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress(b"definitely not gzip").is_err());

        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(br#"{"l":1}"#).unwrap();
        let truncated_json = encoder.finish().unwrap();
        assert!(decompress(&truncated_json).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_timestamp() {
        let json = br#"{"l":1,"b":"00000000-0000-0000-0000-000000000000","c":"yesterday","f":[]}"#;
        let err = decode(json).unwrap_err();
        assert!(matches!(err, CounterlinkError::InvalidPayload(_)));
    }

    proptest! {
        #[test]
        fn prop_payload_round_trip(
            location in 0u32..1000,
            rows in proptest::collection::vec((0i64..4_000_000_000, 0u32..10_000, 0usize..3), 0..60),
        ) {
            let names = ["TRAX_1.CSV", "TRAX_2.CSV", "TRAX_3.PRN"];
            let records = rows
                .into_iter()
                .map(|(secs, count, file)| {
                    VehiclePassageRecord::new(Utc.timestamp_opt(secs, 0).unwrap(), count, names[file])
                })
                .collect();
            let batch = Batch::new(location, Utc.timestamp_opt(1_700_000_000, 0).unwrap(), records);

            let payload = compress(&batch).unwrap();
            prop_assert_eq!(decompress(&payload).unwrap(), batch);
        }
    }
}
