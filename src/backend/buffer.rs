// GPU buffers: staging and resident
//
// Staging buffers are host-visible, mapped for their whole lifetime, and
// used only as transfer sources/destinations. Resident buffers are
// device-local and are written exclusively through a staging copy recorded
// on a one-time command buffer; direct CPU access fails fast.

use ash::vk;
use std::sync::Arc;

use super::commands;
use super::VulkanDevice;
use crate::error::{RendererError, Result};

/// A device-visible memory allocation with its size and, when host-visible,
/// its persistently mapped pointer.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    host_visible: bool,
    mapped: *mut std::ffi::c_void,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    /// Long-lived device-local buffer. Transfer usage is always added so the
    /// staging upload (and readback) path can reach it.
    pub fn new_resident(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::create(
            device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
    }

    /// Transient host-visible buffer used only to shuttle data across the
    /// CPU-GPU boundary.
    pub fn new_staging(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::create(device, size, usage, vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn create(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        if size == 0 {
            return Err(RendererError::InvalidArguments("buffer size must be non-zero"));
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }?;

        let mem_requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let memory_type_index = match find_memory_type(
            &device,
            mem_requirements.memory_type_bits,
            memory_properties,
        ) {
            Ok(index) => index,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(RendererError::AllocationFailure {
                    what: "buffer memory",
                    source: e,
                });
            }
        };

        let host_visible = memory_properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

        let bind_and_map = (|| -> Result<*mut std::ffi::c_void> {
            unsafe { device.device.bind_buffer_memory(buffer, memory, 0) }?;
            if host_visible {
                let ptr = unsafe {
                    device
                        .device
                        .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                }?;
                Ok(ptr)
            } else {
                Ok(std::ptr::null_mut())
            }
        })();

        let mapped = match bind_and_map {
            Ok(ptr) => ptr,
            Err(e) => {
                unsafe {
                    device.device.destroy_buffer(buffer, None);
                    device.device.free_memory(memory, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            buffer,
            memory,
            size,
            host_visible,
            mapped,
            device,
        })
    }

    /// Copy `data` into the mapped range and flush it. Fails fast on
    /// device-local buffers: those are written via the staging upload only.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if !self.host_visible {
            return Err(RendererError::NotHostVisible);
        }
        if data.len() as vk::DeviceSize > self.size {
            return Err(RendererError::InvalidArguments("payload larger than buffer"));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.mapped as *mut u8, data.len());
        }
        // The memory is only required to be host-visible, not coherent
        self.flush()
    }

    /// Read the mapped range back after invalidating it.
    pub fn read(&self, out: &mut [u8]) -> Result<()> {
        if !self.host_visible {
            return Err(RendererError::NotHostVisible);
        }
        if out.len() as vk::DeviceSize > self.size {
            return Err(RendererError::InvalidArguments("read larger than buffer"));
        }

        let range = vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe {
            self.device.device.invalidate_mapped_memory_ranges(&[range])?;
            std::ptr::copy_nonoverlapping(self.mapped as *const u8, out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe { self.device.device.flush_mapped_memory_ranges(&[range]) }?;
        Ok(())
    }

    /// Upload `data` into this resident buffer through a transient staging
    /// buffer and a one-time command buffer, blocking until the copy has
    /// completed on the GPU.
    pub fn upload(&self, command_pool: vk::CommandPool, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(RendererError::InvalidArguments("upload payload must be non-empty"));
        }
        if data.len() as vk::DeviceSize > self.size {
            return Err(RendererError::InvalidArguments("payload larger than buffer"));
        }

        let staging = GpuBuffer::new_staging(
            self.device.clone(),
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        staging.write(data)?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: data.len() as vk::DeviceSize,
        };

        commands::submit_one_time(&self.device, command_pool, |cmd| {
            unsafe {
                self.device
                    .device
                    .cmd_copy_buffer(cmd, staging.buffer, self.buffer, &[region]);
            }
            Ok(())
        })
    }

    /// Read this resident buffer back through a staging download. Exists to
    /// make upload correctness observable end to end.
    pub fn download(&self, command_pool: vk::CommandPool, out: &mut [u8]) -> Result<()> {
        if out.is_empty() || out.len() as vk::DeviceSize > self.size {
            return Err(RendererError::InvalidArguments("download size out of range"));
        }

        let staging = GpuBuffer::new_staging(
            self.device.clone(),
            out.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST,
        )?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: out.len() as vk::DeviceSize,
        };

        commands::submit_one_time(&self.device, command_pool, |cmd| {
            unsafe {
                self.device
                    .device
                    .cmd_copy_buffer(cmd, self.buffer, staging.buffer, &[region]);
            }
            Ok(())
        })?;

        staging.read(out)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            if !self.mapped.is_null() {
                self.device.device.unmap_memory(self.memory);
            }
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Find a suitable memory type index for the requested properties.
pub(crate) fn find_memory_type(
    device: &VulkanDevice,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let mem_properties = &device.memory_properties;

    for i in 0..mem_properties.memory_type_count {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = mem_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);

        if has_type && has_properties {
            return Ok(i);
        }
    }

    Err(RendererError::AllocationFailure {
        what: "memory type",
        source: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
    })
}
