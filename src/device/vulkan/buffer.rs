//! Host-visible staging buffers

use ash::{vk, Device};

use crate::error::{EngineError, Result};

/// Storage buffer backed by host-visible, host-coherent memory.
pub struct StagingMemory {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    /// Requested length in bytes.
    pub len: usize,
    /// Allocated size, rounded up to whole 32-bit words.
    pub size: u64,
}

impl StagingMemory {
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        len: usize,
    ) -> Result<Self> {
        let size = (len.max(4) as u64).next_multiple_of(4);
        let alloc_err = |reason: String| EngineError::AllocationFailed { bytes: len, reason };

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::STORAGE_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None) }
            .map_err(|e| alloc_err(format!("vkCreateBuffer: {:?}", e)))?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory_type_index = match find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ) {
            Some(index) => index,
            None => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(alloc_err("no host-visible coherent memory type".to_string()));
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(alloc_err(format!("vkAllocateMemory: {:?}", e)));
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(alloc_err(format!("vkBindBufferMemory: {:?}", e)));
        }

        Ok(Self { buffer, memory, len, size })
    }

    /// Copy `data` into the start of the buffer.
    pub fn write(&self, device: &Device, data: &[u8]) -> Result<()> {
        if data.len() > self.len {
            return Err(EngineError::TransferFailed(format!(
                "upload of {} bytes exceeds buffer size {}",
                data.len(),
                self.len
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        unsafe {
            let ptr = device
                .map_memory(self.memory, 0, data.len() as u64, vk::MemoryMapFlags::empty())
                .map_err(|e| EngineError::TransferFailed(format!("vkMapMemory: {:?}", e)))?;

            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());

            device.unmap_memory(self.memory);
        }

        Ok(())
    }

    /// Copy the start of the buffer into `data`.
    pub fn read(&self, device: &Device, data: &mut [u8]) -> Result<()> {
        if data.len() > self.len {
            return Err(EngineError::TransferFailed(format!(
                "download of {} bytes exceeds buffer size {}",
                data.len(),
                self.len
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        unsafe {
            let ptr = device
                .map_memory(self.memory, 0, data.len() as u64, vk::MemoryMapFlags::empty())
                .map_err(|e| EngineError::TransferFailed(format!("vkMapMemory: {:?}", e)))?;

            std::ptr::copy_nonoverlapping(ptr as *const u8, data.as_mut_ptr(), data.len());

            device.unmap_memory(self.memory);
        }

        Ok(())
    }

    pub fn destroy(self, device: &Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_memory_type_respects_filter_and_flags() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED;

        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b111, wanted), Some(1));
        assert_eq!(find_memory_type(&props, 0b100, wanted), Some(2));
        assert_eq!(find_memory_type(&props, 0b001, wanted), None);
    }
}
