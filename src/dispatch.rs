//! Batch dispatcher
//!
//! [`BatchHasher::hash_batch`] takes N packed 33-byte records and fills
//! N packed 32-byte digests in the same order:
//!
//! 1. check preconditions and that the engine holds a device
//! 2. allocate input (N×33) and output (N×32) staging
//! 3. upload the records
//! 4. launch ⌈N / group_size⌉ groups of lanes
//! 5. wait for every lane
//! 6. download the digests into the caller's buffer
//! 7. release staging
//!
//! Staging is held by [`StagingBuffer`] guards, so step 7 happens on every
//! exit path. The caller's output is written only by step 6, and only
//! when the whole download succeeds.
//!
//! A batch larger than [`Device::max_batch`] reuses one pair of staging
//! buffers for several launches of at most that many records each. Their
//! digests are gathered in host memory and copied to the caller after the
//! last launch succeeds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::device::{BufferId, Device, LaunchGrid};
use crate::error::{EngineError, Result};
use crate::sha256::{Digest, Record, DIGEST_LEN, RECORD_LEN};

/// Default lanes per execution group.
pub const DEFAULT_GROUP_SIZE: u32 = 128;

/// Dispatcher configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Lanes per execution group. Affects utilization only, never results.
    pub group_size: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { group_size: DEFAULT_GROUP_SIZE }
    }
}

impl DispatchConfig {
    fn validate(&self) -> Result<()> {
        if self.group_size == 0 {
            return Err(EngineError::precondition("group_size must be non-zero"));
        }
        Ok(())
    }
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Batches that completed successfully.
    pub batches: u64,
    /// Records hashed by successful batches.
    pub lanes: u64,
    /// Batches that returned an error after reaching the device.
    pub failures: u64,
    /// Wall time spent inside successful batches.
    pub busy: Duration,
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    lanes: AtomicU64,
    failures: AtomicU64,
    busy_nanos: AtomicU64,
}

/// Staging memory owned by one in-flight batch; freed on drop.
pub struct StagingBuffer<'d, D: Device> {
    device: &'d D,
    id: BufferId,
    len: usize,
    released: bool,
}

impl<'d, D: Device> StagingBuffer<'d, D> {
    pub fn allocate(device: &'d D, len: usize) -> Result<Self> {
        let id = device.allocate(len)?;
        Ok(Self { device, id, len, released: false })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free after a successful batch.
    pub fn release(mut self) {
        self.released = true;
    }
}

impl<D: Device> Drop for StagingBuffer<'_, D> {
    fn drop(&mut self) {
        if !self.released {
            log::warn!(
                "Releasing {} bytes of staging ({:?}) after a failed batch",
                self.len,
                self.id
            );
        }
        self.device.free(self.id);
    }
}

enum EngineState<D> {
    Uninitialized,
    Ready(D),
    Failed(String),
}

/// Hashes batches of 33-byte records on a [`Device`].
///
/// # Example
///
/// ```no_run
/// use sha256_lanes::{BatchHasher, CpuGrid, CpuGridOptions, DispatchConfig};
///
/// # fn main() -> sha256_lanes::Result<()> {
/// let hasher = BatchHasher::<CpuGrid>::open(&CpuGridOptions::default(), DispatchConfig::default())?;
///
/// let input = vec![0u8; 4 * 33];
/// let mut output = vec![0u8; 4 * 32];
/// hasher.hash_batch(&input, &mut output, 4)?;
/// # Ok(())
/// # }
/// ```
pub struct BatchHasher<D: Device> {
    config: DispatchConfig,
    state: EngineState<D>,
    counters: Counters,
}

impl<D: Device> BatchHasher<D> {
    /// An engine with no device. `hash_batch` fails until
    /// [`initialize`](Self::initialize) succeeds.
    pub fn uninitialized(config: DispatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, state: EngineState::Uninitialized, counters: Counters::default() })
    }

    /// Create and initialize in one step.
    pub fn open(options: &D::Options, config: DispatchConfig) -> Result<Self> {
        let mut hasher = Self::uninitialized(config)?;
        hasher.initialize(options)?;
        Ok(hasher)
    }

    /// Wrap a device that is already open.
    pub fn with_device(device: D, config: DispatchConfig) -> Result<Self> {
        config.validate()?;
        log::info!("BatchHasher ready on {} (group_size={})", device.name(), config.group_size);
        Ok(Self { config, state: EngineState::Ready(device), counters: Counters::default() })
    }

    /// Open the device.
    ///
    /// A failed initialization is terminal for this instance: later calls
    /// to `initialize` or `hash_batch` return `EngineNotReady`, and the
    /// caller has to build a new engine.
    pub fn initialize(&mut self, options: &D::Options) -> Result<()> {
        match &self.state {
            EngineState::Ready(device) => {
                return Err(EngineError::precondition(format!(
                    "engine already initialized on {}",
                    device.name()
                )))
            }
            EngineState::Failed(reason) => {
                return Err(EngineError::EngineNotReady(format!(
                    "initialization previously failed ({}); create a new engine",
                    reason
                )))
            }
            EngineState::Uninitialized => {}
        }

        match D::open(options) {
            Ok(device) => {
                log::info!(
                    "BatchHasher ready on {} (group_size={})",
                    device.name(),
                    self.config.group_size
                );
                self.state = EngineState::Ready(device);
                Ok(())
            }
            Err(e) => {
                log::warn!("BatchHasher initialization failed: {}", e);
                self.state = EngineState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Release the device. The engine can be initialized again afterwards,
    /// unless its last initialization failed.
    pub fn shutdown(&mut self) {
        if let EngineState::Ready(device) = &self.state {
            log::info!("BatchHasher shutting down {}", device.name());
            self.state = EngineState::Uninitialized;
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, EngineState::Ready(_))
    }

    pub fn device(&self) -> Option<&D> {
        match &self.state {
            EngineState::Ready(device) => Some(device),
            _ => None,
        }
    }

    pub fn config(&self) -> DispatchConfig {
        self.config
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            lanes: self.counters.lanes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            busy: Duration::from_nanos(self.counters.busy_nanos.load(Ordering::Relaxed)),
        }
    }

    fn ready_device(&self) -> Result<&D> {
        match &self.state {
            EngineState::Ready(device) => Ok(device),
            EngineState::Uninitialized => {
                Err(EngineError::EngineNotReady("engine has not been initialized".to_string()))
            }
            EngineState::Failed(reason) => Err(EngineError::EngineNotReady(format!(
                "initialization failed: {}",
                reason
            ))),
        }
    }

    /// Hash `count` packed records from `input` into `output`.
    ///
    /// `input.len()` must be `count * 33` and `output.len()` must be
    /// `count * 32`. On error `output` is left untouched.
    pub fn hash_batch(&self, input: &[u8], output: &mut [u8], count: usize) -> Result<()> {
        let input_len = count
            .checked_mul(RECORD_LEN)
            .ok_or_else(|| EngineError::precondition(format!("batch of {} records overflows", count)))?;
        let output_len = count * DIGEST_LEN;

        if input.len() != input_len {
            return Err(EngineError::precondition(format!(
                "input is {} bytes, expected {} ({} records × {})",
                input.len(),
                input_len,
                count,
                RECORD_LEN
            )));
        }
        if output.len() != output_len {
            return Err(EngineError::precondition(format!(
                "output is {} bytes, expected {} ({} digests × {})",
                output.len(),
                output_len,
                count,
                DIGEST_LEN
            )));
        }

        let device = self.ready_device()?;

        if count == 0 {
            return Ok(());
        }
        let start = Instant::now();
        match self.dispatch(device, input, output, count) {
            Ok(()) => {
                let elapsed = start.elapsed();
                self.counters.batches.fetch_add(1, Ordering::Relaxed);
                self.counters.lanes.fetch_add(count as u64, Ordering::Relaxed);
                self.counters
                    .busy_nanos
                    .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
                log::debug!("Batch of {} records hashed in {:.3}ms", count, elapsed.as_secs_f64() * 1000.0);
                Ok(())
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                log::debug!("Batch of {} records failed: {}", count, e);
                Err(e)
            }
        }
    }

    fn dispatch(&self, device: &D, input: &[u8], output: &mut [u8], count: usize) -> Result<()> {
        // Records per launch: the device's staging limit and the 32-bit lane index.
        let per_launch = device.max_batch().min(u32::MAX as usize).max(1);
        let chunk = count.min(per_launch);

        let input_stage = StagingBuffer::allocate(device, chunk * RECORD_LEN)?;
        let output_stage = StagingBuffer::allocate(device, chunk * DIGEST_LEN)?;
        log::debug!(
            "Staged {} + {} bytes on {}",
            input_stage.len(),
            output_stage.len(),
            device.name()
        );

        if chunk == count {
            self.launch_chunk(device, &input_stage, &output_stage, input, output)?;
        } else {
            log::debug!(
                "Batch of {} records split into {} launches of up to {}",
                count,
                count.div_ceil(chunk),
                chunk
            );

            // Digests are collected here so the caller's buffer stays
            // untouched until every launch has succeeded.
            let mut digests = Vec::new();
            digests
                .try_reserve_exact(output.len())
                .map_err(|e| EngineError::AllocationFailed { bytes: output.len(), reason: e.to_string() })?;
            digests.resize(output.len(), 0);

            for (records, slots) in input
                .chunks(chunk * RECORD_LEN)
                .zip(digests.chunks_mut(chunk * DIGEST_LEN))
            {
                self.launch_chunk(device, &input_stage, &output_stage, records, slots)?;
            }
            output.copy_from_slice(&digests);
        }

        input_stage.release();
        output_stage.release();
        Ok(())
    }

    /// Upload, launch, wait and download one run of at most `chunk` records
    /// through the batch's staging buffers.
    fn launch_chunk(
        &self,
        device: &D,
        input_stage: &StagingBuffer<'_, D>,
        output_stage: &StagingBuffer<'_, D>,
        records: &[u8],
        slots: &mut [u8],
    ) -> Result<()> {
        let lanes = records.len() / RECORD_LEN;
        device.upload(input_stage.id(), records)?;

        // lanes <= per_launch <= u32::MAX
        let grid = LaunchGrid::new(lanes as u32, self.config.group_size, device.max_groups_x())?;
        let launch = device.launch(input_stage.id(), output_stage.id(), grid)?;
        device.wait(launch)?;

        device.download(output_stage.id(), slots)
    }

    /// Hash a slice of records, returning digests in the same order.
    pub fn hash_records(&self, records: &[Record]) -> Result<Vec<Digest>> {
        let input: Vec<u8> = records.iter().flatten().copied().collect();
        let mut output = vec![0u8; records.len() * DIGEST_LEN];
        self.hash_batch(&input, &mut output, records.len())?;

        Ok(output
            .chunks_exact(DIGEST_LEN)
            .map(|chunk| {
                let mut digest = [0u8; DIGEST_LEN];
                digest.copy_from_slice(chunk);
                digest
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CpuGrid, CpuGridOptions};

    fn hasher() -> BatchHasher<CpuGrid> {
        BatchHasher::open(
            &CpuGridOptions { threads: Some(2), memory_limit: None },
            DispatchConfig { group_size: 16 },
        )
        .unwrap()
    }

    #[test]
    fn test_staging_buffer_frees_on_drop() {
        let dev = CpuGrid::open(&CpuGridOptions::default()).unwrap();
        {
            let _a = StagingBuffer::allocate(&dev, 66).unwrap();
            let b = StagingBuffer::allocate(&dev, 64).unwrap();
            assert_eq!(dev.live_buffers(), 2);
            b.release();
            assert_eq!(dev.live_buffers(), 1);
        }
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn test_uninitialized_engine_not_ready() {
        let hasher = BatchHasher::<CpuGrid>::uninitialized(DispatchConfig::default()).unwrap();
        let err = hasher.hash_batch(&[0u8; 33], &mut [0u8; 32], 1).unwrap_err();
        assert!(matches!(err, EngineError::EngineNotReady(_)));
    }

    #[test]
    fn test_failed_initialization_is_terminal() {
        let mut hasher = BatchHasher::<CpuGrid>::uninitialized(DispatchConfig::default()).unwrap();
        let bad = CpuGridOptions { threads: Some(0), memory_limit: None };
        assert!(hasher.initialize(&bad).is_err());

        // Even good options do not revive this instance.
        let err = hasher.initialize(&CpuGridOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::EngineNotReady(_)));
        assert!(!hasher.is_ready());
    }

    #[test]
    fn test_zero_group_size_rejected() {
        let result = BatchHasher::<CpuGrid>::uninitialized(DispatchConfig { group_size: 0 });
        assert!(matches!(result, Err(EngineError::PreconditionViolation(_))));
    }

    #[test]
    fn test_length_preconditions() {
        let hasher = hasher();
        let err = hasher.hash_batch(&[0u8; 32], &mut [0u8; 32], 1).unwrap_err();
        assert!(matches!(err, EngineError::PreconditionViolation(_)));

        let err = hasher.hash_batch(&[0u8; 33], &mut [0u8; 31], 1).unwrap_err();
        assert!(matches!(err, EngineError::PreconditionViolation(_)));
        assert_eq!(hasher.stats().failures, 0);
    }

    #[test]
    fn test_empty_batch() {
        let hasher = hasher();
        hasher.hash_batch(&[], &mut [], 0).unwrap();
        assert_eq!(hasher.stats(), BatchStats::default());
    }

    #[test]
    fn test_stats_accumulate() {
        let hasher = hasher();
        let records = vec![[1u8; RECORD_LEN]; 40];
        hasher.hash_records(&records).unwrap();
        hasher.hash_records(&records[..3]).unwrap();

        let stats = hasher.stats();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.lanes, 43);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn test_shutdown_and_reinitialize() {
        let mut hasher = hasher();
        hasher.shutdown();
        assert!(!hasher.is_ready());
        assert!(hasher.hash_records(&[[0u8; RECORD_LEN]]).is_err());

        hasher.initialize(&CpuGridOptions::default()).unwrap();
        assert_eq!(hasher.hash_records(&[[0u8; RECORD_LEN]]).unwrap().len(), 1);
    }
}
