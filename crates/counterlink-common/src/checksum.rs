//! Checksum utilities for upload payloads
//!
//! The uploader sends the SHA-256 of every compressed payload so the server
//! can recognize a retransmitted batch by content.

use crate::error::{CounterlinkError, Result};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of an in-memory payload
pub fn payload_digest(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Verify a payload against an expected hex digest
pub fn verify_payload(payload: &[u8], expected: &str) -> Result<()> {
    let actual = payload_digest(payload);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CounterlinkError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_payload_digest() {
        assert_eq!(payload_digest(b"hello world"), HELLO_SHA256);
    }

    #[test]
    fn test_verify_payload() {
        assert!(verify_payload(b"hello world", &HELLO_SHA256.to_uppercase()).is_ok());

        let err = verify_payload(b"hello there", HELLO_SHA256).unwrap_err();
        assert!(matches!(err, CounterlinkError::ChecksumMismatch { .. }));
    }
}
