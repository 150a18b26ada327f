//! Execution devices
//!
//! A [`Device`] is an opened execution context with the lane kernel
//! already loaded. The batch dispatcher drives it through a fixed
//! sequence: allocate staging, upload, launch, wait, download, free.
//!
//! ```text
//!             BatchHasher<D: Device>
//!                      │
//!         ┌────────────┴────────────┐
//!         ▼                         ▼
//!   ┌──────────┐              ┌──────────────┐
//!   │ CpuGrid  │              │ VulkanDevice │
//!   │ (rayon)  │              │ (SPIR-V lane │
//!   └──────────┘              │   kernel)    │
//!                             └──────────────┘
//! ```
//!
//! Staging buffers are identified by [`BufferId`]; every call that
//! allocates one owns it exclusively until it frees it, so independent
//! batches may share a device.

pub mod cpu;
pub mod vulkan;

pub use cpu::{CpuGrid, CpuGridOptions};
pub use vulkan::{VulkanDevice, VulkanOptions};

use crate::error::{EngineError, Result};

/// Handle to a staging buffer owned by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) u64);

/// Handle to a submitted launch that has not been waited on yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchId(pub(crate) u64);

/// Shape of one kernel launch.
///
/// `lanes` lanes are split into `groups` groups of `group_size`; the
/// groups are laid out as a `groups_x` × `groups_y` grid so that no
/// dimension exceeds the device limit. The last group may be partial and
/// the grid may contain trailing groups past `lanes`; those lanes do
/// nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGrid {
    pub lanes: u32,
    pub group_size: u32,
    pub groups: u32,
    pub groups_x: u32,
    pub groups_y: u32,
}

impl LaunchGrid {
    pub fn new(lanes: u32, group_size: u32, max_groups_x: u32) -> Result<Self> {
        if group_size == 0 {
            return Err(EngineError::precondition("group size must be non-zero"));
        }
        if max_groups_x == 0 {
            return Err(EngineError::precondition("device reports zero workgroups per dimension"));
        }

        let groups = lanes.div_ceil(group_size);
        let groups_x = groups.min(max_groups_x).max(1);
        let groups_y = groups.div_ceil(groups_x).max(1);

        Ok(Self { lanes, group_size, groups, groups_x, groups_y })
    }

    /// Lanes covered by one row of the grid.
    pub fn lanes_per_row(&self) -> u32 {
        self.groups_x.saturating_mul(self.group_size)
    }
}

/// An opened execution context with the lane kernel loaded.
///
/// Implementations must be safe to call from several threads at once;
/// buffers and launches of different batches never alias.
pub trait Device: Send + Sync + Sized {
    /// Configuration needed to open the device.
    type Options;

    /// Open the device and load the lane kernel.
    fn open(options: &Self::Options) -> Result<Self>;

    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Largest group count allowed in the x dimension of a launch.
    fn max_groups_x(&self) -> u32 {
        u32::MAX
    }

    /// Largest number of records one launch may stage on this device.
    /// Larger batches are split by the dispatcher.
    fn max_batch(&self) -> usize {
        u32::MAX as usize
    }

    /// Allocate `len` bytes of staging memory.
    fn allocate(&self, len: usize) -> Result<BufferId>;

    /// Release a staging buffer. Unknown ids are ignored.
    fn free(&self, buffer: BufferId);

    /// Copy `data` to the start of `buffer`.
    fn upload(&self, buffer: BufferId, data: &[u8]) -> Result<()>;

    /// Copy the first `data.len()` bytes of `buffer` into `data`.
    ///
    /// `data` is written only when the whole transfer succeeds.
    fn download(&self, buffer: BufferId, data: &mut [u8]) -> Result<()>;

    /// Start the lane kernel over `grid.lanes` records of `input`,
    /// writing digests to `output`.
    fn launch(&self, input: BufferId, output: BufferId, grid: LaunchGrid) -> Result<LaunchId>;

    /// Block until a launch has finished on every lane.
    fn wait(&self, launch: LaunchId) -> Result<()>;

    /// Number of staging buffers currently allocated.
    fn live_buffers(&self) -> usize;
}

/// Backend selection for callers that pick the device at runtime.
#[derive(Debug, Clone)]
pub enum BackendOptions {
    Cpu(CpuGridOptions),
    Vulkan(VulkanOptions),
}

impl Default for BackendOptions {
    fn default() -> Self {
        BackendOptions::Cpu(CpuGridOptions::default())
    }
}

/// A device chosen at runtime.
pub enum AnyDevice {
    Cpu(CpuGrid),
    Vulkan(VulkanDevice),
}

macro_rules! delegate {
    ($self:ident, $dev:ident => $call:expr) => {
        match $self {
            AnyDevice::Cpu($dev) => $call,
            AnyDevice::Vulkan($dev) => $call,
        }
    };
}

impl Device for AnyDevice {
    type Options = BackendOptions;

    fn open(options: &BackendOptions) -> Result<Self> {
        match options {
            BackendOptions::Cpu(opts) => CpuGrid::open(opts).map(AnyDevice::Cpu),
            BackendOptions::Vulkan(opts) => VulkanDevice::open(opts).map(AnyDevice::Vulkan),
        }
    }

    fn name(&self) -> &str {
        delegate!(self, d => d.name())
    }

    fn max_groups_x(&self) -> u32 {
        delegate!(self, d => d.max_groups_x())
    }

    fn max_batch(&self) -> usize {
        delegate!(self, d => d.max_batch())
    }

    fn allocate(&self, len: usize) -> Result<BufferId> {
        delegate!(self, d => d.allocate(len))
    }

    fn free(&self, buffer: BufferId) {
        delegate!(self, d => d.free(buffer))
    }

    fn upload(&self, buffer: BufferId, data: &[u8]) -> Result<()> {
        delegate!(self, d => d.upload(buffer, data))
    }

    fn download(&self, buffer: BufferId, data: &mut [u8]) -> Result<()> {
        delegate!(self, d => d.download(buffer, data))
    }

    fn launch(&self, input: BufferId, output: BufferId, grid: LaunchGrid) -> Result<LaunchId> {
        delegate!(self, d => d.launch(input, output, grid))
    }

    fn wait(&self, launch: LaunchId) -> Result<()> {
        delegate!(self, d => d.wait(launch))
    }

    fn live_buffers(&self) -> usize {
        delegate!(self, d => d.live_buffers())
    }
}
