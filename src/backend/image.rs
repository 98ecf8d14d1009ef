// GPU images: creation, layout transitions, texture upload
//
// Texture upload mirrors the buffer upload path with two explicit layout
// transitions around the copy. Transition pairs outside the supported
// table are rejected with a typed error and no side effects.

use ash::vk;
use std::sync::Arc;

use super::buffer::{find_memory_type, GpuBuffer};
use super::commands;
use super::VulkanDevice;
use crate::error::{RendererError, Result};

/// An image, its memory, and its view, destroyed together.
pub struct GpuImage {
    pub image: vk::Image,
    memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    device: Arc<VulkanDevice>,
}

impl GpuImage {
    pub fn new(
        device: Arc<VulkanDevice>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }?;

        let mem_requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = (|| -> Result<vk::DeviceMemory> {
            let memory_type_index = find_memory_type(
                &device,
                mem_requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;

            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(mem_requirements.size)
                .memory_type_index(memory_type_index);

            let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
                .map_err(|e| RendererError::AllocationFailure {
                    what: "image memory",
                    source: e,
                })?;

            unsafe { device.device.bind_image_memory(image, memory, 0) }.map_err(|e| {
                unsafe { device.device.free_memory(memory, None) };
                RendererError::from(e)
            })?;

            Ok(memory)
        })();

        let memory = match allocation {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = match unsafe { device.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.device.destroy_image(image, None);
                    device.device.free_memory(memory, None);
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            image,
            memory,
            view,
            format,
            device,
        })
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Access masks and pipeline stages for a supported layout transition pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// The supported transition pairs. Anything else returns `None`; callers
/// must reject it rather than guess at barrier masks.
pub(crate) fn transition_masks(
    from: vk::ImageLayout,
    to: vk::ImageLayout,
) -> Option<TransitionMasks> {
    match (from, to) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => {
            Some(TransitionMasks {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            })
        }
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Some(TransitionMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        _ => None,
    }
}

/// Record a layout transition barrier, or fail without recording anything
/// when the pair is not supported.
pub fn cmd_transition_layout(
    device: &VulkanDevice,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    from: vk::ImageLayout,
    to: vk::ImageLayout,
) -> Result<()> {
    let Some(masks) = transition_masks(from, to) else {
        log::warn!("Unsupported image layout transition {:?} -> {:?}", from, to);
        return Err(RendererError::UnsupportedLayoutTransition { from, to });
    };

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .old_layout(from)
        .new_layout(to)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();

    unsafe {
        device.device.cmd_pipeline_barrier(
            command_buffer,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }

    Ok(())
}

/// A sampled 2D texture in shader-read-only layout.
pub struct Texture {
    pub image: GpuImage,
    pub extent: vk::Extent2D,
}

/// Upload RGBA8 pixel data into a new device-local sampled texture.
pub fn create_texture(
    device: &Arc<VulkanDevice>,
    command_pool: vk::CommandPool,
    pixels: &[u8],
    width: u32,
    height: u32,
) -> Result<Texture> {
    if width == 0 || height == 0 {
        return Err(RendererError::InvalidArguments("texture extent must be non-zero"));
    }
    if pixels.len() != (width * height * 4) as usize {
        return Err(RendererError::InvalidArguments("texture payload must be width*height RGBA8"));
    }

    let extent = vk::Extent2D { width, height };
    let image = GpuImage::new(
        device.clone(),
        extent,
        vk::Format::R8G8B8A8_SRGB,
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        vk::ImageAspectFlags::COLOR,
    )?;

    let staging = GpuBuffer::new_staging(
        device.clone(),
        pixels.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
    )?;
    staging.write(pixels)?;

    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .build();

    commands::submit_one_time(device, command_pool, |cmd| {
        cmd_transition_layout(
            device,
            cmd,
            image.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;

        unsafe {
            device.device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        cmd_transition_layout(
            device,
            cmd,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    })?;

    Ok(Texture { image, extent })
}

/// Shared linear sampler for item textures.
pub fn create_sampler(device: &VulkanDevice) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR);

    let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }?;
    Ok(sampler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_transitions_are_supported() {
        let masks = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(masks.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);

        let masks = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(masks.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn arbitrary_transitions_are_rejected() {
        assert!(transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .is_none());
        assert!(transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .is_none());
        assert!(transition_masks(
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::GENERAL,
        )
        .is_none());
    }
}
