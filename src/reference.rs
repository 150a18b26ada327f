//! Reference SHA-256 used to validate batch output.
//!
//! Wraps the streaming `sha2` implementation (arbitrary length,
//! update/finalize). Nothing in the dispatch path calls this; it exists
//! to check what the dispatch path produced.

use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::sha256::{Digest, DIGEST_LEN, RECORD_LEN};

/// SHA-256 of an arbitrary byte string.
pub fn digest(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Reference digests for a packed batch of records.
pub fn digest_batch(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() / RECORD_LEN * DIGEST_LEN);
    for record in input.chunks_exact(RECORD_LEN) {
        out.extend_from_slice(&digest(record));
    }
    out
}

/// Batch output disagreed with the reference engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "{mismatches}/{total} digests do not match the reference (first at record {first_index}: \
     expected {}, got {})",
    hex::encode(.expected),
    hex::encode(.actual)
)]
pub struct BatchMismatch {
    pub first_index: usize,
    pub mismatches: usize,
    pub total: usize,
    pub expected: Digest,
    pub actual: Digest,
}

/// Compare packed batch output against the reference digest of every
/// packed input record.
///
/// Buffers whose lengths disagree on the record count are reported as a
/// mismatch at the first record past the shorter side.
pub fn verify_batch(input: &[u8], output: &[u8]) -> Result<(), BatchMismatch> {
    let records = input.len() / RECORD_LEN;
    let digests = output.len() / DIGEST_LEN;
    let total = records.max(digests);

    let mut first: Option<(usize, Digest, Digest)> = None;
    let mut mismatches = 0usize;

    for i in 0..total {
        let expected = input
            .get(i * RECORD_LEN..(i + 1) * RECORD_LEN)
            .map(digest)
            .unwrap_or([0u8; DIGEST_LEN]);
        let mut actual = [0u8; DIGEST_LEN];
        let present = output
            .get(i * DIGEST_LEN..(i + 1) * DIGEST_LEN)
            .map(|slot| actual.copy_from_slice(slot))
            .is_some();

        if !present || i >= records || expected != actual {
            mismatches += 1;
            if first.is_none() {
                first = Some((i, expected, actual));
            }
        }
    }

    match first {
        None => Ok(()),
        Some((first_index, expected, actual)) => {
            log::debug!(
                "reference check: {}/{} mismatches, first at {}",
                mismatches,
                total,
                first_index
            );
            Err(BatchMismatch { first_index, mismatches, total, expected, actual })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256::hash_record;

    #[test]
    fn test_reference_agrees_with_lane() {
        let mut record = [0u8; RECORD_LEN];
        for (i, b) in record.iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(digest(&record), hash_record(&record));
    }

    #[test]
    fn test_verify_reports_first_mismatch() {
        let input: Vec<u8> = (0..3u8).flat_map(|i| [i; RECORD_LEN]).collect();
        let mut output = digest_batch(&input);
        assert!(verify_batch(&input, &output).is_ok());

        output[DIGEST_LEN + 5] ^= 0xFF;
        output[2 * DIGEST_LEN] ^= 0x01;
        let err = verify_batch(&input, &output).unwrap_err();
        assert_eq!(err.first_index, 1);
        assert_eq!(err.mismatches, 2);
        assert_eq!(err.total, 3);
    }

    #[test]
    fn test_verify_short_output() {
        let input = vec![7u8; 2 * RECORD_LEN];
        let output = digest_batch(&input[..RECORD_LEN]);
        let err = verify_batch(&input, &output).unwrap_err();
        assert_eq!(err.first_index, 1);
        assert_eq!(err.mismatches, 1);
    }
}
