//! CPU execution grid
//!
//! Staging buffers live in host memory; a launch runs one lane per
//! record. Groups run in parallel on a rayon pool, lanes within a group
//! run back to back (the same shape a GPU workgroup has).
//!
//! Each buffer has its own lock, so independent batches never contend
//! on anything but the buffer table.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use super::{BufferId, Device, LaunchGrid, LaunchId};
use crate::error::{EngineError, Result};
use crate::sha256::{run_lane, DIGEST_LEN, RECORD_LEN};

/// Options for [`CpuGrid`].
#[derive(Debug, Clone, Default)]
pub struct CpuGridOptions {
    /// Worker threads for a dedicated pool. `None` uses rayon's global pool.
    pub threads: Option<usize>,

    /// Cap on the total bytes of live staging buffers.
    pub memory_limit: Option<usize>,
}

#[derive(Default)]
struct Arena {
    buffers: HashMap<u64, Arc<RwLock<Vec<u8>>>>,
    live_bytes: usize,
}

/// Host-memory device running the lane program on a rayon pool.
pub struct CpuGrid {
    name: String,
    pool: Option<rayon::ThreadPool>,
    memory_limit: Option<usize>,
    arena: Mutex<Arena>,
    // Outcome of each launch that has not been waited on yet
    launches: Mutex<HashMap<u64, std::result::Result<(), String>>>,
    next_id: AtomicU64,
}

impl CpuGrid {
    /// Bytes of staging memory currently allocated.
    pub fn live_bytes(&self) -> usize {
        self.arena.lock().live_bytes
    }

    fn buffer(&self, id: BufferId) -> Result<Arc<RwLock<Vec<u8>>>> {
        self.arena
            .lock()
            .buffers
            .get(&id.0)
            .cloned()
            .ok_or_else(|| EngineError::TransferFailed(format!("unknown staging buffer {:?}", id)))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run every lane of `grid`. Groups are the unit of parallel work.
    fn execute(&self, input: &[u8], output: &mut [u8], grid: LaunchGrid) {
        let lanes = grid.lanes as usize;
        let group = grid.group_size as usize;
        let input = &input[..lanes * RECORD_LEN];
        let output = &mut output[..lanes * DIGEST_LEN];

        let mut run = || {
            input
                .par_chunks(group * RECORD_LEN)
                .zip(output.par_chunks_mut(group * DIGEST_LEN))
                .for_each(|(records, slots)| {
                    for (record, slot) in records
                        .chunks_exact(RECORD_LEN)
                        .zip(slots.chunks_exact_mut(DIGEST_LEN))
                    {
                        run_lane(record, slot);
                    }
                });
        };

        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}

impl Device for CpuGrid {
    type Options = CpuGridOptions;

    fn open(options: &CpuGridOptions) -> Result<Self> {
        let pool = match options.threads {
            Some(0) => {
                return Err(EngineError::InitializationFailed(
                    "CPU grid needs at least one worker thread".to_string(),
                ))
            }
            Some(n) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("sha256-lane-{}", i))
                    .build()
                    .map_err(|e| EngineError::InitializationFailed(e.to_string()))?,
            ),
            None => None,
        };

        let threads = pool
            .as_ref()
            .map(|p| p.current_num_threads())
            .unwrap_or_else(rayon::current_num_threads);
        let name = format!("cpu-grid ({} threads)", threads);

        log::info!(
            "CpuGrid initialized: {} (memory_limit={:?})",
            name,
            options.memory_limit
        );

        Ok(Self {
            name,
            pool,
            memory_limit: options.memory_limit,
            arena: Mutex::new(Arena::default()),
            launches: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, len: usize) -> Result<BufferId> {
        let mut arena = self.arena.lock();

        if let Some(limit) = self.memory_limit {
            if arena.live_bytes.saturating_add(len) > limit {
                return Err(EngineError::AllocationFailed {
                    bytes: len,
                    reason: format!(
                        "memory limit {} exceeded ({} bytes already live)",
                        limit, arena.live_bytes
                    ),
                });
            }
        }

        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| EngineError::AllocationFailed {
            bytes: len,
            reason: e.to_string(),
        })?;
        data.resize(len, 0);

        let id = self.next_id();
        arena.buffers.insert(id, Arc::new(RwLock::new(data)));
        arena.live_bytes += len;

        log::trace!("CpuGrid allocated buffer {} ({} bytes)", id, len);
        Ok(BufferId(id))
    }

    fn free(&self, buffer: BufferId) {
        let mut arena = self.arena.lock();
        if let Some(data) = arena.buffers.remove(&buffer.0) {
            arena.live_bytes -= data.read().len();
            log::trace!("CpuGrid freed buffer {}", buffer.0);
        }
    }

    fn upload(&self, buffer: BufferId, data: &[u8]) -> Result<()> {
        let target = self.buffer(buffer)?;
        let mut target = target.write();
        if data.len() > target.len() {
            return Err(EngineError::TransferFailed(format!(
                "upload of {} bytes exceeds buffer size {}",
                data.len(),
                target.len()
            )));
        }
        target[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn download(&self, buffer: BufferId, data: &mut [u8]) -> Result<()> {
        let source = self.buffer(buffer)?;
        let source = source.read();
        if data.len() > source.len() {
            return Err(EngineError::TransferFailed(format!(
                "download of {} bytes exceeds buffer size {}",
                data.len(),
                source.len()
            )));
        }
        data.copy_from_slice(&source[..data.len()]);
        Ok(())
    }

    fn launch(&self, input: BufferId, output: BufferId, grid: LaunchGrid) -> Result<LaunchId> {
        if input == output {
            return Err(EngineError::LaunchFailed(
                "input and output must be distinct buffers".to_string(),
            ));
        }
        if grid.group_size == 0 {
            return Err(EngineError::LaunchFailed("group size must be non-zero".to_string()));
        }

        let input = self.buffer(input).map_err(|e| EngineError::LaunchFailed(e.to_string()))?;
        let output = self.buffer(output).map_err(|e| EngineError::LaunchFailed(e.to_string()))?;
        let input = input.read();
        let mut output = output.write();

        let lanes = grid.lanes as usize;
        if input.len() < lanes * RECORD_LEN || output.len() < lanes * DIGEST_LEN {
            return Err(EngineError::LaunchFailed(format!(
                "grid of {} lanes does not fit staging ({} in / {} out bytes)",
                lanes,
                input.len(),
                output.len()
            )));
        }

        log::debug!(
            "CpuGrid launch: {} lanes in {} groups of {}",
            grid.lanes,
            grid.groups,
            grid.group_size
        );

        // A lane fault surfaces at wait(), the way a device fault does.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute(&input, &mut output, grid)
        }))
        .map_err(|payload| {
            payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "lane panicked".to_string())
        });

        let id = self.next_id();
        self.launches.lock().insert(id, outcome);
        Ok(LaunchId(id))
    }

    fn wait(&self, launch: LaunchId) -> Result<()> {
        match self.launches.lock().remove(&launch.0) {
            Some(Ok(())) => Ok(()),
            Some(Err(fault)) => Err(EngineError::ExecutionFailed(fault)),
            None => Err(EngineError::ExecutionFailed(format!("unknown launch {:?}", launch))),
        }
    }

    fn live_buffers(&self) -> usize {
        self.arena.lock().buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256::hash_record;

    fn grid() -> CpuGrid {
        CpuGrid::open(&CpuGridOptions { threads: Some(2), memory_limit: None }).unwrap()
    }

    #[test]
    fn test_launch_hashes_every_lane() {
        let dev = grid();
        let lanes = 300u32;
        let input: Vec<u8> = (0..lanes).flat_map(|i| [(i % 251) as u8; RECORD_LEN]).collect();

        let inp = dev.allocate(input.len()).unwrap();
        let out = dev.allocate(lanes as usize * DIGEST_LEN).unwrap();
        dev.upload(inp, &input).unwrap();

        let launch = dev.launch(inp, out, LaunchGrid::new(lanes, 64, u32::MAX).unwrap()).unwrap();
        dev.wait(launch).unwrap();

        let mut digests = vec![0u8; lanes as usize * DIGEST_LEN];
        dev.download(out, &mut digests).unwrap();

        for (record, digest) in input.chunks_exact(RECORD_LEN).zip(digests.chunks_exact(DIGEST_LEN)) {
            let mut r = [0u8; RECORD_LEN];
            r.copy_from_slice(record);
            assert_eq!(digest, &hash_record(&r)[..]);
        }

        dev.free(inp);
        dev.free(out);
        assert_eq!(dev.live_buffers(), 0);
        assert_eq!(dev.live_bytes(), 0);
    }

    #[test]
    fn test_launch_on_global_pool() {
        let dev = CpuGrid::open(&CpuGridOptions::default()).unwrap();
        let record = [0x02u8; RECORD_LEN];

        let inp = dev.allocate(RECORD_LEN).unwrap();
        let out = dev.allocate(DIGEST_LEN).unwrap();
        dev.upload(inp, &record).unwrap();
        let launch = dev.launch(inp, out, LaunchGrid::new(1, 128, u32::MAX).unwrap()).unwrap();
        dev.wait(launch).unwrap();

        let mut digest = [0u8; DIGEST_LEN];
        dev.download(out, &mut digest).unwrap();
        assert_eq!(digest, hash_record(&record));
    }

    #[test]
    fn test_memory_limit() {
        let dev = CpuGrid::open(&CpuGridOptions { threads: Some(1), memory_limit: Some(100) }).unwrap();
        let a = dev.allocate(66).unwrap();
        let err = dev.allocate(64).unwrap_err();
        assert!(matches!(err, EngineError::AllocationFailed { bytes: 64, .. }));

        dev.free(a);
        assert!(dev.allocate(64).is_ok());
    }

    #[test]
    fn test_oversized_upload_rejected() {
        let dev = grid();
        let buf = dev.allocate(10).unwrap();
        assert!(matches!(dev.upload(buf, &[0u8; 11]), Err(EngineError::TransferFailed(_))));
    }

    #[test]
    fn test_launch_rejects_undersized_output() {
        let dev = grid();
        let inp = dev.allocate(2 * RECORD_LEN).unwrap();
        let out = dev.allocate(DIGEST_LEN).unwrap();
        let grid = LaunchGrid::new(2, 128, u32::MAX).unwrap();
        assert!(matches!(dev.launch(inp, out, grid), Err(EngineError::LaunchFailed(_))));
    }

    #[test]
    fn test_wait_unknown_launch() {
        let dev = grid();
        assert!(matches!(dev.wait(LaunchId(999)), Err(EngineError::ExecutionFailed(_))));
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(CpuGrid::open(&CpuGridOptions { threads: Some(0), memory_limit: None }).is_err());
    }
}
