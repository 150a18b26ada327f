//! Lane program: one record in, one digest out.
//!
//! `digest = serialize(compress(H0, pad(record)))`. Exactly one
//! compression step per lane; no lane touches another lane's slots.

use super::compress::compress;
use super::constants::{DIGEST_LEN, H0, RECORD_LEN};
use super::padding::pad_record;
use super::{Digest, HashState, Record};

/// Hash one record.
#[inline]
pub fn hash_record(record: &Record) -> Digest {
    let mut state: HashState = H0;
    compress(&mut state, &pad_record(record));
    serialize_state(&state)
}

/// Big-endian concatenation of the eight state words.
#[inline]
pub fn serialize_state(state: &HashState) -> Digest {
    let mut out = [0u8; DIGEST_LEN];
    for (chunk, word) in out.chunks_exact_mut(4).zip(state) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    out
}

/// Run the lane program over one staged input slot and its output slot.
///
/// Slot lengths are fixed by the staging layout: `input` is one
/// `RECORD_LEN` record and `output` one `DIGEST_LEN` slot.
#[inline]
pub fn run_lane(input: &[u8], output: &mut [u8]) {
    debug_assert_eq!(input.len(), RECORD_LEN);
    debug_assert_eq!(output.len(), DIGEST_LEN);

    let mut record = [0u8; RECORD_LEN];
    record.copy_from_slice(input);
    output.copy_from_slice(&hash_record(&record));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference;
    use proptest::prelude::*;

    #[test]
    fn test_generator_pubkey_digest() {
        let record: Record = [
            0x02, 0x79, 0xBE, 0x66, 0x7E, 0xF9, 0xDC, 0xBB, 0xAC, 0x55, 0xA0, 0x62,
            0x95, 0xCE, 0x87, 0x0B, 0x07, 0x02, 0x9B, 0xFC, 0xDB, 0x2D, 0xCE, 0x28,
            0xD9, 0x59, 0xF2, 0x81, 0x5B, 0x16, 0xF8, 0x17, 0x98,
        ];
        let expected: Digest = [
            0x0f, 0x71, 0x5b, 0xaf, 0x5d, 0x4c, 0x2e, 0xd3, 0x29, 0x78, 0x5c, 0xef,
            0x29, 0xe5, 0x62, 0xf7, 0x34, 0x88, 0xc8, 0xa2, 0xbb, 0x9d, 0xbc, 0x57,
            0x00, 0xb3, 0x61, 0xd5, 0x4b, 0x9b, 0x05, 0x54,
        ];
        assert_eq!(hash_record(&record), expected);
    }

    #[test]
    fn test_serialize_is_big_endian() {
        let state = [0x01020304, 0, 0, 0, 0, 0, 0, 0xA0B0C0D0];
        let out = serialize_state(&state);
        assert_eq!(&out[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&out[28..], &[0xA0, 0xB0, 0xC0, 0xD0]);
    }

    #[test]
    fn test_run_lane_matches_hash_record() {
        let record = [0x5Au8; RECORD_LEN];
        let mut slot = [0u8; DIGEST_LEN];
        run_lane(&record, &mut slot);
        assert_eq!(slot, hash_record(&record));
    }

    proptest! {
        #[test]
        fn hash_record_matches_sha2(bytes in proptest::collection::vec(any::<u8>(), RECORD_LEN)) {
            let mut record: Record = [0u8; RECORD_LEN];
            record.copy_from_slice(&bytes);
            prop_assert_eq!(hash_record(&record), reference::digest(&bytes));
        }

        #[test]
        fn run_lane_matches_sha2(bytes in proptest::collection::vec(any::<u8>(), RECORD_LEN)) {
            let mut slot = [0u8; DIGEST_LEN];
            run_lane(&bytes, &mut slot);
            prop_assert_eq!(slot, reference::digest(&bytes));
        }
    }
}
