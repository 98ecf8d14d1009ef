// Synchronization primitives
//
// One frame slot per swapchain image: fence for CPU-GPU frame completion,
// two semaphores for GPU-GPU ordering, and the slot's command buffer.
// The fence wait is the only mutual exclusion over a slot's resources.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{RendererError, Result};

/// Defensive upper bound on any fence wait. The GPU is expected to always
/// make progress; expiry indicates a lost device and is fatal.
pub const FENCE_TIMEOUT_NS: u64 = 5_000_000_000;

/// Frame synchronization and recording state for one in-flight slot.
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
}

impl FrameSlot {
    pub fn new(device: &Arc<VulkanDevice>, command_pool: vk::CommandPool) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first frame's wait passes immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        unsafe {
            Ok(Self {
                image_available: device.device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)?,
                in_flight: device.device.create_fence(&fence_info, None)?,
                command_buffer: device.device.allocate_command_buffers(&alloc_info)?[0],
            })
        }
    }

    /// Block until the slot's previous submission has completed.
    ///
    /// A timed-out wait is a device-lost condition, not retried.
    pub fn wait(&self, device: &ash::Device) -> Result<()> {
        let result =
            unsafe { device.wait_for_fences(&[self.in_flight], true, FENCE_TIMEOUT_NS) };
        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RendererError::DeviceLost {
                timeout_ms: FENCE_TIMEOUT_NS / 1_000_000,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn destroy(&self, device: &ash::Device, command_pool: vk::CommandPool) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
            device.free_command_buffers(command_pool, &[self.command_buffer]);
        }
    }
}
