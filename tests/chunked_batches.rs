//! Batches larger than a device's per-launch limit.

use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq;

use sha256_lanes::reference;
use sha256_lanes::{
    BatchHasher, BufferId, CpuGrid, CpuGridOptions, Device, DispatchConfig, EngineError, ErrorKind,
    LaunchGrid, LaunchId, Result, DIGEST_LEN, RECORD_LEN,
};

/// CPU grid that stages at most `max_batch` records per launch, like a
/// GPU with a small `maxStorageBufferRange`.
struct SmallRangeDevice {
    inner: CpuGrid,
    max_batch: usize,
    launches: AtomicUsize,
    largest_allocation: AtomicUsize,
    // 0-based launch that reports a fault
    fail_launch: Option<usize>,
}

impl SmallRangeDevice {
    fn new(max_batch: usize, fail_launch: Option<usize>) -> Self {
        Self {
            inner: CpuGrid::open(&CpuGridOptions { threads: Some(2), memory_limit: None }).unwrap(),
            max_batch,
            launches: AtomicUsize::new(0),
            largest_allocation: AtomicUsize::new(0),
            fail_launch,
        }
    }
}

impl Device for SmallRangeDevice {
    type Options = usize;

    fn open(max_batch: &usize) -> Result<Self> {
        Ok(Self::new(*max_batch, None))
    }

    fn name(&self) -> &str {
        "small-range-cpu-grid"
    }

    fn max_batch(&self) -> usize {
        self.max_batch
    }

    fn allocate(&self, len: usize) -> Result<BufferId> {
        self.largest_allocation.fetch_max(len, Ordering::SeqCst);
        self.inner.allocate(len)
    }

    fn free(&self, buffer: BufferId) {
        self.inner.free(buffer)
    }

    fn upload(&self, buffer: BufferId, data: &[u8]) -> Result<()> {
        self.inner.upload(buffer, data)
    }

    fn download(&self, buffer: BufferId, data: &mut [u8]) -> Result<()> {
        self.inner.download(buffer, data)
    }

    fn launch(&self, input: BufferId, output: BufferId, grid: LaunchGrid) -> Result<LaunchId> {
        assert!(grid.lanes as usize <= self.max_batch, "launch of {} lanes", grid.lanes);
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.inner.launch(input, output, grid)
    }

    fn wait(&self, launch: LaunchId) -> Result<()> {
        let outcome = self.inner.wait(launch);
        if self.fail_launch == Some(self.launches.load(Ordering::SeqCst) - 1) {
            return Err(EngineError::ExecutionFailed("injected".into()));
        }
        outcome
    }

    fn live_buffers(&self) -> usize {
        self.inner.live_buffers()
    }
}

fn batch(count: usize) -> Vec<u8> {
    (0..count * RECORD_LEN).map(|i| (i * 13 + i / 33) as u8).collect()
}

#[test]
fn test_oversized_batch_is_split() {
    let hasher =
        BatchHasher::with_device(SmallRangeDevice::new(100, None), DispatchConfig { group_size: 32 })
            .unwrap();
    let input = batch(1001);
    let mut output = vec![0u8; 1001 * DIGEST_LEN];

    hasher.hash_batch(&input, &mut output, 1001).unwrap();

    assert_eq!(output, reference::digest_batch(&input));
    let device = hasher.device().unwrap();
    assert_eq!(device.launches.load(Ordering::SeqCst), 11);
    assert_eq!(device.largest_allocation.load(Ordering::SeqCst), 100 * RECORD_LEN);
    assert_eq!(device.live_buffers(), 0);

    let stats = hasher.stats();
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.lanes, 1001);
}

#[test]
fn test_exact_multiple_of_limit() {
    let hasher =
        BatchHasher::with_device(SmallRangeDevice::new(50, None), DispatchConfig::default()).unwrap();
    let input = batch(200);
    let mut output = vec![0u8; 200 * DIGEST_LEN];

    hasher.hash_batch(&input, &mut output, 200).unwrap();

    assert_eq!(output, reference::digest_batch(&input));
    assert_eq!(hasher.device().unwrap().launches.load(Ordering::SeqCst), 4);
}

#[test]
fn test_batch_within_limit_uses_one_launch() {
    let hasher =
        BatchHasher::with_device(SmallRangeDevice::new(500, None), DispatchConfig::default()).unwrap();
    let input = batch(500);
    let mut output = vec![0u8; 500 * DIGEST_LEN];

    hasher.hash_batch(&input, &mut output, 500).unwrap();

    assert_eq!(output, reference::digest_batch(&input));
    assert_eq!(hasher.device().unwrap().launches.load(Ordering::SeqCst), 1);
}

#[test]
fn test_late_launch_failure_writes_nothing() {
    let hasher =
        BatchHasher::with_device(SmallRangeDevice::new(100, Some(7)), DispatchConfig::default())
            .unwrap();
    let input = batch(1000);
    let mut output = vec![0xAA; 1000 * DIGEST_LEN];

    let err = hasher.hash_batch(&input, &mut output, 1000).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
    assert!(output.iter().all(|&b| b == 0xAA));
    assert_eq!(hasher.device().unwrap().launches.load(Ordering::SeqCst), 8);
    assert_eq!(hasher.device().unwrap().live_buffers(), 0);
    assert_eq!(hasher.stats().failures, 1);
}

#[test]
#[ignore = "hashes 10M records; run with --release --ignored"]
fn test_ten_million_records_at_minimum_storage_range() {
    // Vulkan guarantees maxStorageBufferRange >= 2^27 bytes.
    let per_launch = (1usize << 27) / RECORD_LEN;
    let hasher =
        BatchHasher::with_device(SmallRangeDevice::new(per_launch, None), DispatchConfig::default())
            .unwrap();
    let count = 10_000_000;
    let input = batch(count);
    let mut output = vec![0u8; count * DIGEST_LEN];

    hasher.hash_batch(&input, &mut output, count).unwrap();

    reference::verify_batch(&input, &output).unwrap();
    assert_eq!(hasher.device().unwrap().launches.load(Ordering::SeqCst), 3);
}
