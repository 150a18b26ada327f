//! Lane kernel module and its compute pipelines
//!
//! One shader module, one descriptor set layout (binding 0 = records,
//! binding 1 = digests), one pipeline layout with an 8-byte push constant
//! range. The workgroup size is specialization constant 0, so each group
//! size gets its own pipeline, built on first use and cached.

use std::collections::HashMap;
use std::ffi::CString;

use ash::{vk, Device};
use parking_lot::Mutex;

use crate::error::{EngineError, Result};

/// Push constants read by the lane kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LanePushConstants {
    /// Lanes that hold a record; the rest of the grid exits early.
    pub count: u32,
    /// Lanes per grid row (`groups_x * group_size`).
    pub lanes_per_row: u32,
}

impl LanePushConstants {
    pub const SIZE: u32 = 8;

    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.count.to_ne_bytes());
        out[4..].copy_from_slice(&self.lanes_per_row.to_ne_bytes());
        out
    }
}

pub struct LaneKernel {
    shader: vk::ShaderModule,
    entry_point: CString,
    pub desc_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    // Keyed by workgroup size
    pipelines: Mutex<HashMap<u32, vk::Pipeline>>,
}

impl LaneKernel {
    pub fn new(device: &Device, spirv: &[u32], entry_point: &str) -> Result<Self> {
        let entry_point = CString::new(entry_point).map_err(|e| {
            EngineError::InitializationFailed(format!("invalid entry point name: {}", e))
        })?;

        let shader_info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let shader = unsafe { device.create_shader_module(&shader_info, None) }
            .map_err(|e| EngineError::KernelLoadFailed(format!("vkCreateShaderModule: {:?}", e)))?;

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..2)
            .map(|i| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        let desc_set_layout = match unsafe { device.create_descriptor_set_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_shader_module(shader, None) };
                return Err(EngineError::KernelLoadFailed(format!(
                    "vkCreateDescriptorSetLayout: {:?}",
                    e
                )));
            }
        };

        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(LanePushConstants::SIZE);
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&desc_set_layout))
            .push_constant_ranges(std::slice::from_ref(&push_constant_range));

        let pipeline_layout = match unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe {
                    device.destroy_descriptor_set_layout(desc_set_layout, None);
                    device.destroy_shader_module(shader, None);
                }
                return Err(EngineError::KernelLoadFailed(format!(
                    "vkCreatePipelineLayout: {:?}",
                    e
                )));
            }
        };

        log::debug!(
            "Lane kernel module created: entry_point={:?}, {} words",
            entry_point,
            spirv.len()
        );

        Ok(Self {
            shader,
            entry_point,
            desc_set_layout,
            pipeline_layout,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    /// Pipeline specialized for `group_size` lanes per workgroup.
    pub fn pipeline(&self, device: &Device, group_size: u32) -> Result<vk::Pipeline> {
        let mut pipelines = self.pipelines.lock();
        if let Some(&pipeline) = pipelines.get(&group_size) {
            return Ok(pipeline);
        }

        let spec_entries = [vk::SpecializationMapEntry::default()
            .constant_id(0)
            .offset(0)
            .size(std::mem::size_of::<u32>())];
        let spec_data = group_size.to_ne_bytes();
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&spec_entries)
            .data(&spec_data);

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.shader)
            .name(&self.entry_point)
            .specialization_info(&spec_info);

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(self.pipeline_layout);

        let pipeline = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| EngineError::LaunchFailed(format!("vkCreateComputePipelines: {:?}", e)))?
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::LaunchFailed("driver returned no pipeline".to_string()))?;

        log::info!("Lane pipeline built for group size {}", group_size);
        pipelines.insert(group_size, pipeline);
        Ok(pipeline)
    }

    pub fn destroy(&self, device: &Device) {
        unsafe {
            for (_, pipeline) in self.pipelines.lock().drain() {
                device.destroy_pipeline(pipeline, None);
            }
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.desc_set_layout, None);
            device.destroy_shader_module(self.shader, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256::schedule::block_words;
    use crate::sha256::{pad_record, serialize_state, Record, RECORD_LEN};

    const KERNEL_SOURCE: &str = include_str!("../../../shaders/sha256_lane.comp");

    // Host mirrors of the kernel's record access. The records binding is
    // the packed byte stream read as little-endian 32-bit words.
    fn load_byte(words: &[u32], offset: usize) -> u32 {
        (words[offset >> 2] >> ((offset & 3) * 8)) & 0xff
    }

    fn load_be_word(words: &[u32], offset: usize) -> u32 {
        (load_byte(words, offset) << 24)
            | (load_byte(words, offset + 1) << 16)
            | (load_byte(words, offset + 2) << 8)
            | load_byte(words, offset + 3)
    }

    fn kernel_block(words: &[u32], lane: usize) -> [u32; 16] {
        let base = lane * RECORD_LEN;
        let mut w = [0u32; 16];
        for (i, word) in w.iter_mut().take(8).enumerate() {
            *word = load_be_word(words, base + i * 4);
        }
        w[8] = (load_byte(words, base + 32) << 24) | 0x0080_0000;
        w[15] = 264;
        w
    }

    #[test]
    fn test_push_constants_layout() {
        assert_eq!(std::mem::size_of::<LanePushConstants>(), LanePushConstants::SIZE as usize);

        let push = LanePushConstants { count: 1, lanes_per_row: 0x0100 };
        let bytes = push.to_bytes();
        assert_eq!(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 1);
        assert_eq!(u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 0x0100);
    }

    #[test]
    fn test_kernel_block_words_match_padding() {
        // Five records put every lane at a different offset mod 4.
        let records: Vec<Record> = (0..5u8)
            .map(|lane| std::array::from_fn(|i| lane.wrapping_mul(71).wrapping_add((i as u8).wrapping_mul(13))))
            .collect();

        let mut packed: Vec<u8> = records.iter().flatten().copied().collect();
        packed.resize(packed.len().next_multiple_of(4), 0);
        let words: Vec<u32> = packed
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        for (lane, record) in records.iter().enumerate() {
            assert_eq!(kernel_block(&words, lane), block_words(&pad_record(record)), "lane {}", lane);
        }
    }

    #[test]
    fn test_kernel_digest_words_serialize_big_endian() {
        let state = [0x0f715baf, 0x5d4c2ed3, 0x29785cef, 0x29e562f7, 0x3488c8a2, 0xbb9dbc57, 0x00b361d5, 0x4b9b0554];
        // The kernel stores bswap(word); the host reads the buffer as little-endian memory.
        let stored: Vec<u8> = state.iter().flat_map(|h: &u32| h.swap_bytes().to_le_bytes()).collect();
        assert_eq!(stored, serialize_state(&state));
    }

    #[test]
    fn test_kernel_source_uses_mirrored_formulas() {
        for fragment in [
            "uint base = lane * 33u;",
            "(records[offset >> 2u] >> ((offset & 3u) * 8u)) & 0xffu",
            "w[8] = (load_byte(base + 32u) << 24u) | 0x00800000u;",
            "w[15] = 264u;",
            "uint evicted = w[slot];",
            "digests[out_base + 0u] = bswap(H0[0] + a);",
        ] {
            assert!(KERNEL_SOURCE.contains(fragment), "kernel source lost `{}`", fragment);
        }
    }
}
