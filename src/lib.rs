//! sha256_lanes: one-hash-per-lane SHA-256 over batches of 33-byte records
//!
//! Each record (a 33-byte compressed public key, typically) is hashed by
//! its own lane. A record always fits in a single padded block, so every
//! lane runs exactly one compression.
//!
//! Two devices run the lane program:
//!
//! - [`CpuGrid`]: host memory, groups of lanes spread over a rayon pool
//! - [`VulkanDevice`]: a SPIR-V compute kernel (`shaders/sha256_lane.comp`)
//!
//! # Example
//!
//! ```no_run
//! use sha256_lanes::{BatchHasher, CpuGrid, CpuGridOptions, DispatchConfig};
//!
//! # fn main() -> sha256_lanes::Result<()> {
//! let hasher = BatchHasher::<CpuGrid>::open(&CpuGridOptions::default(), DispatchConfig::default())?;
//! let digests = hasher.hash_records(&[[0x02; 33], [0x03; 33]])?;
//! assert_eq!(digests.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod dispatch;
pub mod error;
pub mod reference;
pub mod sha256;

#[cfg(feature = "python")]
mod python;

pub use device::{
    AnyDevice, BackendOptions, BufferId, CpuGrid, CpuGridOptions, Device, LaunchGrid, LaunchId,
    VulkanDevice, VulkanOptions,
};
pub use dispatch::{BatchHasher, BatchStats, DispatchConfig, StagingBuffer, DEFAULT_GROUP_SIZE};
pub use error::{EngineError, ErrorKind, Result};
pub use sha256::{hash_record, Digest, Record, DIGEST_LEN, RECORD_LEN};
