// Command pool and one-time command submission
//
// The pool serves both the per-slot frame buffers and the transient
// buffers used by the upload path. One-time submissions are synchronous:
// record, submit under the queue guard, block on a dedicated fence, free.

use ash::vk;
use std::sync::Arc;

use super::sync::FENCE_TIMEOUT_NS;
use super::VulkanDevice;
use crate::error::{RendererError, Result};

pub fn create_command_pool(device: &Arc<VulkanDevice>) -> Result<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(device.graphics_queue_family)
        // TRANSIENT: upload buffers are short-lived
        // RESET: frame buffers are re-recorded individually
        .flags(
            vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        );

    let pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;
    Ok(pool)
}

/// Record and synchronously execute transfer work outside the per-frame
/// recording slots. Blocks until the GPU has finished the submission.
pub fn submit_one_time<F>(
    device: &Arc<VulkanDevice>,
    command_pool: vk::CommandPool,
    record: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer) -> Result<()>,
{
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }?[0];

    let result = record_and_submit(device, command_buffer, record);

    unsafe {
        device
            .device
            .free_command_buffers(command_pool, &[command_buffer]);
    }

    result
}

fn record_and_submit<F>(
    device: &Arc<VulkanDevice>,
    command_buffer: vk::CommandBuffer,
    record: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer) -> Result<()>,
{
    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe {
        device.device.begin_command_buffer(command_buffer, &begin_info)?;
    }

    record(command_buffer)?;

    unsafe {
        device.device.end_command_buffer(command_buffer)?;
    }

    let fence_info = vk::FenceCreateInfo::builder();
    let fence = unsafe { device.device.create_fence(&fence_info, None) }?;

    let command_buffers = [command_buffer];
    let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

    let submit_result = {
        let _guard = device.submit_lock.lock();
        unsafe {
            device
                .device
                .queue_submit(device.graphics_queue, &[submit_info.build()], fence)
        }
    };

    let wait_result = submit_result.map_err(RendererError::from).and_then(|()| {
        let waited = unsafe { device.device.wait_for_fences(&[fence], true, FENCE_TIMEOUT_NS) };
        match waited {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RendererError::DeviceLost {
                timeout_ms: FENCE_TIMEOUT_NS / 1_000_000,
            }),
            Err(e) => Err(e.into()),
        }
    });

    unsafe {
        device.device.destroy_fence(fence, None);
    }

    wait_result
}
