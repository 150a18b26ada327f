//! Vulkan compute backend
//!
//! Opens an instance and a logical device with one compute queue, loads
//! the precompiled lane kernel, and runs batches as a single dispatch:
//!
//! ```text
//! records ──map/copy──▶ [binding 0] ──lane kernel──▶ [binding 1] ──map/copy──▶ digests
//! ```
//!
//! Staging buffers are host-visible and coherent, so transfers are plain
//! memory copies through a mapping. Queue submission, command buffer
//! recording and descriptor allocation share one lock; fences are waited
//! on without it, so several batches can be in flight.

mod buffer;
mod kernel;
pub mod spirv;

use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::{vk, Entry, Instance};
use parking_lot::Mutex;

use self::buffer::StagingMemory;
use self::kernel::{LaneKernel, LanePushConstants};
use super::{BufferId, Device, LaunchGrid, LaunchId};
use crate::error::{EngineError, Result};
use crate::sha256::RECORD_LEN;

/// Default location of the compiled lane kernel.
pub const DEFAULT_KERNEL_PATH: &str = "shaders/sha256_lane.spv";

/// Launches that may be pending at once (descriptor pool capacity).
const MAX_IN_FLIGHT: u32 = 64;

/// Options for [`VulkanDevice`].
#[derive(Debug, Clone)]
pub struct VulkanOptions {
    /// GPU index among the enumerated physical devices.
    pub device_index: usize,
    /// Compiled SPIR-V lane kernel.
    pub kernel_path: PathBuf,
    /// Kernel entry point.
    pub entry_point: String,
    /// Enable `VK_LAYER_KHRONOS_validation`.
    pub enable_validation: bool,
}

impl Default for VulkanOptions {
    fn default() -> Self {
        Self {
            device_index: 0,
            kernel_path: PathBuf::from(DEFAULT_KERNEL_PATH),
            entry_point: "main".to_string(),
            enable_validation: cfg!(feature = "validation"),
        }
    }
}

/// State touched by command recording and submission.
struct Submission {
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
}

/// Per-launch objects, released when the launch is waited on.
#[derive(Default)]
struct InFlight {
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
    descriptor_set: vk::DescriptorSet,
}

/// Vulkan device with the lane kernel loaded.
pub struct VulkanDevice {
    /// GPU device name (e.g. "NVIDIA GeForce RTX 4090")
    pub device_name: String,
    /// Vulkan API version reported by the device (e.g. "1.3.277")
    pub api_version: String,

    #[allow(dead_code)]
    entry: Entry,
    instance: Instance,
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: vk::PhysicalDeviceLimits,

    kernel: LaneKernel,
    submission: Mutex<Submission>,
    buffers: Mutex<HashMap<u64, StagingMemory>>,
    launches: Mutex<HashMap<u64, InFlight>>,
    next_id: AtomicU64,
}

impl VulkanDevice {
    /// Create the Vulkan instance, optionally with validation layers.
    fn create_instance(entry: &Entry, enable_validation: bool) -> Result<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"sha256-lanes")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"sha256-lanes")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let layer_ptrs: Vec<*const c_char> = if enable_validation {
            log::info!("Enabling Vulkan validation layers");
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            EngineError::InitializationFailed(format!("vkCreateInstance failed: {:?}", e))
        })?;

        log::debug!("Vulkan instance created");
        Ok(instance)
    }

    /// Select a physical device by index.
    fn select_physical_device(
        instance: &Instance,
        device_index: usize,
    ) -> Result<(vk::PhysicalDevice, vk::PhysicalDeviceProperties)> {
        let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
            EngineError::InitializationFailed(format!("enumerate_physical_devices failed: {:?}", e))
        })?;

        if devices.is_empty() {
            return Err(EngineError::NoSuitableDevice);
        }

        log::info!("Found {} Vulkan device(s)", devices.len());
        for (i, &dev) in devices.iter().enumerate() {
            let props = unsafe { instance.get_physical_device_properties(dev) };
            log::debug!("  Device {}: {}", i, device_name(&props));
        }

        let device = devices
            .get(device_index)
            .copied()
            .ok_or(EngineError::NoSuitableDevice)?;
        let props = unsafe { instance.get_physical_device_properties(device) };

        Ok((device, props))
    }

    /// Create the logical device with one compute queue.
    fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<(ash::Device, vk::Queue, u32)> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let compute_family = queue_families
            .iter()
            .position(|props| props.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .map(|i| i as u32)
            .ok_or_else(|| {
                EngineError::InitializationFailed("no compute queue family found".to_string())
            })?;

        log::debug!("Using queue family {} for compute", compute_family);

        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(compute_family)
            .queue_priorities(&queue_priorities);
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
            .map_err(|e| {
                EngineError::InitializationFailed(format!("vkCreateDevice failed: {:?}", e))
            })?;

        let queue = unsafe { device.get_device_queue(compute_family, 0) };
        Ok((device, queue, compute_family))
    }

    fn create_pools(device: &ash::Device, queue_family: u32) -> Result<(vk::CommandPool, vk::DescriptorPool)> {
        let command_pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&command_pool_info, None) }
            .map_err(|e| EngineError::InitializationFailed(format!("vkCreateCommandPool: {:?}", e)))?;

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(2 * MAX_IN_FLIGHT)];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(MAX_IN_FLIGHT)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        match unsafe { device.create_descriptor_pool(&pool_info, None) } {
            Ok(descriptor_pool) => Ok((command_pool, descriptor_pool)),
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                Err(EngineError::InitializationFailed(format!("vkCreateDescriptorPool: {:?}", e)))
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn buffer_handle(&self, id: BufferId) -> Result<(vk::Buffer, u64)> {
        self.buffers
            .lock()
            .get(&id.0)
            .map(|b| (b.buffer, b.size))
            .ok_or_else(|| EngineError::LaunchFailed(format!("unknown staging buffer {:?}", id)))
    }

    /// Record and submit one dispatch. Every object created here ends up
    /// in `inflight`, so the caller can release them on any failure.
    fn record_and_submit(
        &self,
        submission: &Submission,
        inflight: &mut InFlight,
        pipeline: vk::Pipeline,
        input: (vk::Buffer, u64),
        output: (vk::Buffer, u64),
        grid: LaunchGrid,
    ) -> Result<()> {
        let launch_err = |what: &str, e: vk::Result| EngineError::LaunchFailed(format!("{}: {:?}", what, e));
        let device = &self.device;

        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(submission.descriptor_pool)
            .set_layouts(std::slice::from_ref(&self.kernel.desc_set_layout));
        inflight.descriptor_set = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| launch_err("vkAllocateDescriptorSets", e))?[0];

        let buffer_infos = [
            vk::DescriptorBufferInfo::default().buffer(input.0).offset(0).range(input.1),
            vk::DescriptorBufferInfo::default().buffer(output.0).offset(0).range(output.1),
        ];
        let writes: Vec<vk::WriteDescriptorSet> = buffer_infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(inflight.descriptor_set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        let cmd_alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(submission.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        inflight.command_buffer = unsafe { device.allocate_command_buffers(&cmd_alloc_info) }
            .map_err(|e| launch_err("vkAllocateCommandBuffers", e))?[0];
        let cmd = inflight.command_buffer;

        let push = LanePushConstants { count: grid.lanes, lanes_per_row: grid.lanes_per_row() };
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| launch_err("vkBeginCommandBuffer", e))?;

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.kernel.pipeline_layout,
                0,
                &[inflight.descriptor_set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.kernel.pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                &push.to_bytes(),
            );
            device.cmd_dispatch(cmd, grid.groups_x, grid.groups_y, 1);

            // Make lane writes visible to host reads after the fence.
            let barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );

            device
                .end_command_buffer(cmd)
                .map_err(|e| launch_err("vkEndCommandBuffer", e))?;
        }

        inflight.fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(|e| launch_err("vkCreateFence", e))?;

        let submit_info = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
        unsafe { device.queue_submit(submission.queue, &[submit_info], inflight.fence) }
            .map_err(|e| launch_err("vkQueueSubmit", e))?;

        Ok(())
    }

    /// Release the per-launch objects.
    fn retire(&self, submission: &Submission, inflight: InFlight) {
        unsafe {
            if inflight.fence != vk::Fence::null() {
                self.device.destroy_fence(inflight.fence, None);
            }
            if inflight.command_buffer != vk::CommandBuffer::null() {
                self.device
                    .free_command_buffers(submission.command_pool, &[inflight.command_buffer]);
            }
            if inflight.descriptor_set != vk::DescriptorSet::null() {
                if let Err(e) = self
                    .device
                    .free_descriptor_sets(submission.descriptor_pool, &[inflight.descriptor_set])
                {
                    log::warn!("vkFreeDescriptorSets failed: {:?}", e);
                }
            }
        }
    }
}

/// What to do with a launch's objects once waiting on its fence failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailedWait {
    /// The device is gone; nothing it owns is still pending.
    Retire,
    /// The command buffer may still be executing. Drain the device first.
    DrainThenRetire,
}

fn after_failed_wait(error: vk::Result) -> FailedWait {
    if error == vk::Result::ERROR_DEVICE_LOST {
        FailedWait::Retire
    } else {
        FailedWait::DrainThenRetire
    }
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

impl Device for VulkanDevice {
    type Options = VulkanOptions;

    fn open(options: &VulkanOptions) -> Result<Self> {
        log::info!(
            "Initializing VulkanDevice (device_index={}, kernel={}, validation={})",
            options.device_index,
            options.kernel_path.display(),
            options.enable_validation
        );

        // Read the kernel first; no point bringing up a device without it.
        let spirv = spirv::load_kernel(&options.kernel_path)?;

        let entry = unsafe { Entry::load() }
            .map_err(|e| EngineError::InitializationFailed(format!("failed to load Vulkan: {}", e)))?;
        let instance = Self::create_instance(&entry, options.enable_validation)?;

        let setup = (|| {
            let (physical_device, props) = Self::select_physical_device(&instance, options.device_index)?;
            let (device, queue, queue_family) = Self::create_logical_device(&instance, physical_device)?;
            Ok::<_, EngineError>((physical_device, props, device, queue, queue_family))
        })();
        let (physical_device, props, device, queue, queue_family) = match setup {
            Ok(parts) => parts,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let rest = LaneKernel::new(&device, &spirv, &options.entry_point).and_then(|kernel| {
            match Self::create_pools(&device, queue_family) {
                Ok(pools) => Ok((kernel, pools)),
                Err(e) => {
                    kernel.destroy(&device);
                    Err(e)
                }
            }
        });
        let (kernel, (command_pool, descriptor_pool)) = match rest {
            Ok(parts) => parts,
            Err(e) => {
                unsafe {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let device_name = device_name(&props);
        let api_version = format!(
            "{}.{}.{}",
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version),
            vk::api_version_patch(props.api_version)
        );

        log::info!(
            "VulkanDevice initialized: {} (Vulkan {}, max groups x={}, max group size={})",
            device_name,
            api_version,
            props.limits.max_compute_work_group_count[0],
            props.limits.max_compute_work_group_size[0]
        );

        Ok(Self {
            device_name,
            api_version,
            entry,
            instance,
            device,
            memory_properties,
            limits: props.limits,
            kernel,
            submission: Mutex::new(Submission { queue, command_pool, descriptor_pool }),
            buffers: Mutex::new(HashMap::new()),
            launches: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn name(&self) -> &str {
        &self.device_name
    }

    fn max_groups_x(&self) -> u32 {
        self.limits.max_compute_work_group_count[0]
    }

    fn max_batch(&self) -> usize {
        (self.limits.max_storage_buffer_range as usize / RECORD_LEN).min(u32::MAX as usize)
    }

    fn allocate(&self, len: usize) -> Result<BufferId> {
        let memory = StagingMemory::new(&self.device, &self.memory_properties, len)?;
        let id = self.next_id();
        log::trace!("VulkanDevice allocated buffer {} ({} bytes)", id, memory.size);
        self.buffers.lock().insert(id, memory);
        Ok(BufferId(id))
    }

    fn free(&self, buffer: BufferId) {
        if let Some(memory) = self.buffers.lock().remove(&buffer.0) {
            memory.destroy(&self.device);
            log::trace!("VulkanDevice freed buffer {}", buffer.0);
        }
    }

    fn upload(&self, buffer: BufferId, data: &[u8]) -> Result<()> {
        let buffers = self.buffers.lock();
        let memory = buffers.get(&buffer.0).ok_or_else(|| {
            EngineError::TransferFailed(format!("unknown staging buffer {:?}", buffer))
        })?;
        memory.write(&self.device, data)
    }

    fn download(&self, buffer: BufferId, data: &mut [u8]) -> Result<()> {
        let buffers = self.buffers.lock();
        let memory = buffers.get(&buffer.0).ok_or_else(|| {
            EngineError::TransferFailed(format!("unknown staging buffer {:?}", buffer))
        })?;
        memory.read(&self.device, data)
    }

    fn launch(&self, input: BufferId, output: BufferId, grid: LaunchGrid) -> Result<LaunchId> {
        let limits = &self.limits;
        if grid.group_size > limits.max_compute_work_group_size[0]
            || grid.group_size > limits.max_compute_work_group_invocations
        {
            return Err(EngineError::LaunchFailed(format!(
                "group size {} exceeds device limit {}",
                grid.group_size,
                limits.max_compute_work_group_size[0].min(limits.max_compute_work_group_invocations)
            )));
        }
        if grid.groups_y > limits.max_compute_work_group_count[1] {
            return Err(EngineError::LaunchFailed(format!(
                "grid of {}x{} groups exceeds device limits",
                grid.groups_x, grid.groups_y
            )));
        }

        let input = self.buffer_handle(input)?;
        let output = self.buffer_handle(output)?;
        let pipeline = self.kernel.pipeline(&self.device, grid.group_size)?;

        log::debug!(
            "VulkanDevice dispatch: {} lanes as {}x{} groups of {}",
            grid.lanes,
            grid.groups_x,
            grid.groups_y,
            grid.group_size
        );

        let submission = self.submission.lock();
        let mut inflight = InFlight::default();
        if let Err(e) = self.record_and_submit(&submission, &mut inflight, pipeline, input, output, grid) {
            self.retire(&submission, inflight);
            return Err(e);
        }
        drop(submission);

        let id = self.next_id();
        self.launches.lock().insert(id, inflight);
        Ok(LaunchId(id))
    }

    fn wait(&self, launch: LaunchId) -> Result<()> {
        let inflight = self
            .launches
            .lock()
            .remove(&launch.0)
            .ok_or_else(|| EngineError::ExecutionFailed(format!("unknown launch {:?}", launch)))?;

        let waited = unsafe { self.device.wait_for_fences(&[inflight.fence], true, u64::MAX) };
        let error = match waited {
            Ok(()) => {
                self.retire(&self.submission.lock(), inflight);
                return Ok(());
            }
            Err(e) => e,
        };

        match after_failed_wait(error) {
            FailedWait::Retire => self.retire(&self.submission.lock(), inflight),
            FailedWait::DrainThenRetire => match unsafe { self.device.device_wait_idle() } {
                Ok(()) => self.retire(&self.submission.lock(), inflight),
                Err(idle) => log::warn!(
                    "vkDeviceWaitIdle failed ({:?}) after fence wait error; launch {:?} objects are left to teardown",
                    idle,
                    launch
                ),
            },
        }

        Err(EngineError::ExecutionFailed(format!("vkWaitForFences: {:?}", error)))
    }

    fn live_buffers(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Releasing VulkanDevice {}", self.device_name);
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("vkDeviceWaitIdle failed during teardown: {:?}", e);
            }

            let submission = self.submission.get_mut();
            for (_, inflight) in self.launches.get_mut().drain() {
                self.device.destroy_fence(inflight.fence, None);
            }
            for (_, memory) in self.buffers.get_mut().drain() {
                memory.destroy(&self.device);
            }

            self.kernel.destroy(&self.device);
            // Destroying the pools frees every set and command buffer in them.
            self.device.destroy_descriptor_pool(submission.descriptor_pool, None);
            self.device.destroy_command_pool(submission.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
