// Renderer facade
//
// Owns the device, the swapchain state, the pipeline, and the render item
// store, and drives the per-frame protocol:
//   wait slot fence -> acquire image -> reset + record -> submit -> present
// The slot fence is the only mutual exclusion over a slot's resources.

use ash::vk;
use glam::Mat4;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use slotmap::SlotMap;
use std::sync::Arc;

use crate::backend::buffer::GpuBuffer;
use crate::backend::image::{self, Texture};
use crate::backend::swapchain::Acquire;
use crate::backend::{commands, pipeline, shader, Swapchain, VulkanDevice};
use crate::config::Config;
use crate::error::{RendererError, Result};
use crate::item::{ItemStore, RenderItem, RenderItemDesc, RenderItemKey, TextureKey};

/// Upper bound on simultaneously live render items, set by the descriptor
/// pool capacity.
const MAX_RENDER_ITEMS: u32 = 1024;

/// Push-constant block consumed by the vertex stage.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PushConstants {
    mvp: Mat4,
    model: Mat4,
}

struct PipelineBundle {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

pub struct Renderer {
    config: Config,
    device: Arc<VulkanDevice>,
    command_pool: vk::CommandPool,

    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    sampler: vk::Sampler,
    default_texture: Option<Texture>,
    textures: SlotMap<TextureKey, Texture>,

    swapchain: Swapchain,
    // Built lazily: needs a render pass, which needs a non-empty swapchain
    pipeline: Option<PipelineBundle>,

    items: ItemStore<RenderItem>,

    current_slot: usize,
    // Image index of the frame currently being recorded
    recording: Option<u32>,
    needs_recreate: bool,
    pending_extent: vk::Extent2D,
    shut_down: bool,
}

impl Renderer {
    /// Initialize the backend against the window behind the raw handles.
    ///
    /// Any failure here is fatal to the application; there is no
    /// degraded-mode fallback.
    pub fn new(
        config: Config,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Self> {
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;

        let device = VulkanDevice::new(
            &config.window.title,
            enable_validation,
            display_handle,
            window_handle,
        )?;

        let command_pool = commands::create_command_pool(&device)?;

        let descriptor_set_layout = pipeline::create_descriptor_set_layout(&device)?;
        let descriptor_pool = pipeline::create_descriptor_pool(&device, MAX_RENDER_ITEMS)?;
        let sampler = image::create_sampler(&device)?;

        // Items without a texture sample this instead
        let default_texture =
            image::create_texture(&device, command_pool, &[255, 255, 255, 255], 1, 1)?;

        let extent = vk::Extent2D {
            width: config.window.width,
            height: config.window.height,
        };
        let swapchain = Swapchain::new(
            device.clone(),
            command_pool,
            extent,
            config.preferred_present_mode(),
        )?;

        let mut renderer = Self {
            config,
            device,
            command_pool,
            descriptor_set_layout,
            descriptor_pool,
            sampler,
            default_texture: Some(default_texture),
            textures: SlotMap::with_key(),
            swapchain,
            pipeline: None,
            items: ItemStore::new(),
            current_slot: 0,
            recording: None,
            needs_recreate: false,
            pending_extent: extent,
            shut_down: false,
        };
        renderer.ensure_pipeline()?;

        log::info!("Renderer initialized");
        Ok(renderer)
    }

    /// The host forwards window resize notifications here. A zero extent
    /// (minimized window) suspends rendering until a non-zero resize.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.pending_extent = vk::Extent2D { width, height };
        self.needs_recreate = true;
    }

    /// Begin recording a frame. Returns false when the frame must be
    /// skipped (minimized window, or the swapchain went stale and was just
    /// recreated); the host simply tries again next frame.
    pub fn begin_frame(&mut self) -> Result<bool> {
        self.ensure_live()?;
        if self.recording.is_some() {
            return Err(RendererError::InvalidArguments("begin_frame called while recording"));
        }

        if self.needs_recreate {
            self.recreate_swapchain()?;
        }

        let Some(resources) = self.swapchain.resources() else {
            // Explicit empty state: skip the frame, do not recreate in a loop
            return Ok(false);
        };

        // Step 1: wait for the slot's previous submission to complete
        let slot = &resources.frames[self.current_slot];
        slot.wait(&self.device.device)?;

        // Step 2: acquire the next image, signaling the slot's semaphore
        let acquire = self.swapchain.acquire_next_image(u64::MAX, slot.image_available)?;
        let image_index = match acquire {
            Acquire::Image { index, suboptimal } => {
                if suboptimal {
                    // Render this frame, recreate before the next one
                    self.needs_recreate = true;
                }
                index
            }
            Acquire::OutOfDate => {
                self.needs_recreate = true;
                return Ok(false);
            }
        };

        let cmd = slot.command_buffer;
        let fence = slot.in_flight;
        let render_pass = resources.render_pass;
        let framebuffer = resources.framebuffers[image_index as usize];
        let extent = resources.extent;

        let bundle = self
            .pipeline
            .as_ref()
            .ok_or(RendererError::InvalidArguments("pipeline not initialized"))?;

        // Step 3: reset the fence, then reset and re-record the command
        // buffer. Safe: the fence wait above guarantees the GPU is done
        // with this slot's previous recording.
        unsafe {
            self.device.device.reset_fences(&[fence])?;
            self.device
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;

            let begin_info = vk::CommandBufferBeginInfo::builder();
            self.device.device.begin_command_buffer(cmd, &begin_info)?;
        }

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.config.graphics.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        unsafe {
            self.device
                .device
                .cmd_begin_render_pass(cmd, &pass_info, vk::SubpassContents::INLINE);
            self.device.device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                bundle.pipeline,
            );

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            self.device.device.cmd_set_viewport(cmd, 0, &[viewport]);

            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            self.device.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }

        self.recording = Some(image_index);
        Ok(true)
    }

    /// Record one draw per live item, then submit and present the frame.
    pub fn end_frame(&mut self, view_proj: Mat4) -> Result<()> {
        self.ensure_live()?;
        let image_index = self
            .recording
            .take()
            .ok_or(RendererError::InvalidArguments("end_frame without begin_frame"))?;

        let resources = self
            .swapchain
            .resources()
            .ok_or(RendererError::InvalidArguments("swapchain lost while recording"))?;
        let slot = &resources.frames[self.current_slot];
        let cmd = slot.command_buffer;

        let bundle = self
            .pipeline
            .as_ref()
            .ok_or(RendererError::InvalidArguments("pipeline not initialized"))?;

        for (_, item) in self.items.iter() {
            let push = PushConstants {
                mvp: view_proj * item.transform,
                model: item.transform,
            };

            unsafe {
                self.device.device.cmd_push_constants(
                    cmd,
                    bundle.layout,
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    bytemuck::bytes_of(&push),
                );
                self.device.device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    bundle.layout,
                    0,
                    &[item.descriptor_set],
                    &[],
                );
                self.device.device.cmd_bind_vertex_buffers(
                    cmd,
                    0,
                    &[item.vertex_buffer.buffer],
                    &[0],
                );
                self.device.device.cmd_bind_index_buffer(
                    cmd,
                    item.index_buffer.buffer,
                    0,
                    vk::IndexType::UINT32,
                );
                self.device
                    .device
                    .cmd_draw_indexed(cmd, item.index_count, 1, 0, 0, 0);
            }
        }

        unsafe {
            self.device.device.cmd_end_render_pass(cmd);
            self.device.device.end_command_buffer(cmd)?;
        }

        // Step 4: submit, waiting on the acquire semaphore and signaling
        // the render-complete semaphore and the slot fence
        let wait_semaphores = [slot.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [slot.render_finished];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // Step 5: present waiting on render-complete. Both queue
        // operations run under the submission guard.
        let present_stale = {
            let _guard = self.device.submit_lock.lock();
            unsafe {
                self.device.device.queue_submit(
                    self.device.graphics_queue,
                    &[submit_info.build()],
                    slot.in_flight,
                )?;
            }
            self.swapchain.present(
                self.device.graphics_queue,
                image_index,
                &signal_semaphores,
            )?
        };

        if present_stale {
            self.needs_recreate = true;
        }

        // Step 6: advance the slot index
        self.current_slot = (self.current_slot + 1) % resources.frames.len();

        Ok(())
    }

    /// Validate the payloads, allocate two resident buffers through the
    /// upload pipeline, and return a generation-checked handle. A failure
    /// part way through releases everything already created.
    pub fn create_render_item(&mut self, desc: &RenderItemDesc) -> Result<RenderItemKey> {
        self.ensure_live()?;
        let index_count = desc.validate()?;

        let vertex_buffer = GpuBuffer::new_resident(
            self.device.clone(),
            desc.vertices.len() as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        vertex_buffer.upload(self.command_pool, desc.vertices)?;

        // If anything below fails, the vertex buffer drops and is freed
        let index_buffer = GpuBuffer::new_resident(
            self.device.clone(),
            desc.indices.len() as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        index_buffer.upload(self.command_pool, desc.indices)?;

        let descriptor_set = self.allocate_item_descriptor(desc.texture)?;

        let key = self.items.insert(RenderItem {
            vertex_buffer,
            index_buffer,
            index_count,
            transform: Mat4::IDENTITY,
            texture: desc.texture,
            descriptor_set,
        });

        log::debug!("Created render item with {} indices", index_count);
        Ok(key)
    }

    /// Destroy an item and both of its resident buffers. A stale handle
    /// (including a second destroy of the same handle) is rejected.
    pub fn destroy_render_item(&mut self, key: RenderItemKey) -> Result<()> {
        self.ensure_live()?;
        let item = self.items.remove(key)?;

        // In-flight frames may still reference the buffers
        self.device.wait_idle()?;

        unsafe {
            self.device
                .device
                .free_descriptor_sets(self.descriptor_pool, &[item.descriptor_set])?;
        }
        drop(item);

        log::debug!("Destroyed render item; {} live", self.items.len());
        Ok(())
    }

    /// Update an item's model transform.
    pub fn set_transform(&mut self, key: RenderItemKey, transform: Mat4) -> Result<()> {
        self.items.get_mut(key)?.transform = transform;
        Ok(())
    }

    /// Upload RGBA8 pixels as a sampled texture for items to reference.
    pub fn create_texture(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<TextureKey> {
        self.ensure_live()?;
        let texture = image::create_texture(&self.device, self.command_pool, pixels, width, height)?;
        Ok(self.textures.insert(texture))
    }

    /// Destroy a texture. Rejected while any live item still references it.
    pub fn destroy_texture(&mut self, key: TextureKey) -> Result<()> {
        self.ensure_live()?;
        if self.items.iter().any(|(_, item)| item.texture == Some(key)) {
            return Err(RendererError::InvalidArguments(
                "texture is still referenced by a render item",
            ));
        }
        let texture = self.textures.remove(key).ok_or(RendererError::StaleHandle)?;
        self.device.wait_idle()?;
        drop(texture);
        Ok(())
    }

    /// Number of live render items.
    pub fn live_items(&self) -> usize {
        self.items.len()
    }

    /// Idempotent teardown in reverse creation order. Also run by Drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        log::info!("Shutting down renderer...");

        // Drain all slot fences before destroying anything
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device wait failed during shutdown: {}", e);
        }

        let items = self.items.drain();
        for item in &items {
            let _ = unsafe {
                self.device
                    .device
                    .free_descriptor_sets(self.descriptor_pool, &[item.descriptor_set])
            };
        }
        drop(items);

        let textures: Vec<Texture> = self.textures.drain().map(|(_, texture)| texture).collect();
        drop(textures);
        drop(self.default_texture.take());

        if let Some(bundle) = self.pipeline.take() {
            unsafe {
                self.device.device.destroy_pipeline(bundle.pipeline, None);
                self.device.device.destroy_pipeline_layout(bundle.layout, None);
            }
        }

        unsafe {
            self.device
                .device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            self.device.device.destroy_sampler(self.sampler, None);
        }

        self.swapchain.destroy_resources();

        unsafe {
            self.device
                .device
                .destroy_command_pool(self.command_pool, None);
        }

        // Surface, device, and instance are destroyed when the last
        // device reference drops
        log::info!("Renderer shutdown complete");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.shut_down {
            return Err(RendererError::InvalidArguments("renderer is shut down"));
        }
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        let extent = self.pending_extent;
        self.swapchain
            .recreate(extent, self.config.preferred_present_mode())?;
        self.current_slot = 0;
        self.needs_recreate = false;
        self.ensure_pipeline()?;
        Ok(())
    }

    /// Build the pipeline once a render pass exists. The pipeline is kept
    /// across recreations: rebuilt passes use the same attachment formats
    /// and are therefore render-pass compatible.
    fn ensure_pipeline(&mut self) -> Result<()> {
        if self.pipeline.is_some() {
            return Ok(());
        }
        let Some(render_pass) = self.swapchain.resources().map(|r| r.render_pass) else {
            return Ok(());
        };

        let vert = shader::load_shader_module(&self.device, &self.config.shaders.vertex)?;
        let frag = match shader::load_shader_module(&self.device, &self.config.shaders.fragment) {
            Ok(frag) => frag,
            Err(e) => {
                unsafe { self.device.device.destroy_shader_module(vert, None) };
                return Err(e);
            }
        };

        let result = pipeline::create_graphics_pipeline(
            &self.device,
            render_pass,
            self.descriptor_set_layout,
            vert,
            frag,
        );

        // Modules are compiled into the pipeline; not needed afterwards
        unsafe {
            self.device.device.destroy_shader_module(vert, None);
            self.device.device.destroy_shader_module(frag, None);
        }

        let (pipeline, layout) = result?;
        self.pipeline = Some(PipelineBundle { pipeline, layout });
        Ok(())
    }

    fn allocate_item_descriptor(&self, texture: Option<TextureKey>) -> Result<vk::DescriptorSet> {
        let view = match texture {
            Some(key) => {
                self.textures
                    .get(key)
                    .ok_or(RendererError::StaleHandle)?
                    .image
                    .view
            }
            None => {
                self.default_texture
                    .as_ref()
                    .ok_or(RendererError::InvalidArguments("default texture missing"))?
                    .image
                    .view
            }
        };

        let layouts = [self.descriptor_set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);

        let set = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }?[0];

        let image_info = [vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build();

        unsafe {
            self.device.device.update_descriptor_sets(&[write], &[]);
        }

        Ok(set)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constant_block_matches_pipeline_range() {
        assert_eq!(
            std::mem::size_of::<PushConstants>() as u32,
            pipeline::PUSH_CONSTANT_SIZE
        );
    }
}
