//! SHA-256 for fixed 33-byte records, one compression per record.
//!
//! The pieces compose as `lane::hash_record = compress(H0, pad(record))`.

pub mod compress;
pub mod constants;
pub mod lane;
pub mod padding;
pub mod schedule;

pub use compress::compress;
pub use constants::{BLOCK_LEN, DIGEST_LEN, H0, K, MAX_SINGLE_BLOCK_INPUT, RECORD_LEN};
pub use lane::{hash_record, run_lane, serialize_state};
pub use padding::pad_record;
pub use schedule::{MessageSchedule, ScheduleWindow};

/// One input record.
pub type Record = [u8; RECORD_LEN];

/// One output digest.
pub type Digest = [u8; DIGEST_LEN];

/// One padded 512-bit block.
pub type Block = [u8; BLOCK_LEN];

/// Running hash state `H[0..8]`.
pub type HashState = [u32; 8];
