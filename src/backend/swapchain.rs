// Swapchain - Window presentation
//
// Owns the chain of back-buffer images, their views, the depth buffer,
// the render pass, the framebuffers, and the per-slot frame resources as
// one unit: any invalidation destroys and recreates the whole set. A
// zero-area extent yields an explicit empty state with no Vulkan objects;
// callers skip rendering instead of recreating in a loop.

use ash::vk;
use std::sync::Arc;

use super::image::GpuImage;
use super::pipeline;
use super::sync::FrameSlot;
use super::VulkanDevice;
use crate::error::{RendererError, Result};

/// Depth formats probed in order; the first with depth-stencil attachment
/// support under optimal tiling wins.
const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Result of acquiring the next back-buffer image.
pub enum Acquire {
    /// An image is ready. `suboptimal` asks for a recreate after this frame.
    Image { index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface; recreate and retry
    /// next frame. Not an error.
    OutOfDate,
}

pub struct Swapchain {
    device: Arc<VulkanDevice>,
    loader: ash::extensions::khr::Swapchain,
    command_pool: vk::CommandPool,
    resources: Option<SwapchainResources>,
}

/// Everything invalidated together on resize or surface staleness.
pub struct SwapchainResources {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub depth: GpuImage,
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub frames: Vec<FrameSlot>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        command_pool: vk::CommandPool,
        extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let mut swapchain = Self {
            device,
            loader,
            command_pool,
            resources: None,
        };
        swapchain.resources = swapchain.create_resources(extent, preferred_present_mode)?;
        Ok(swapchain)
    }

    pub fn resources(&self) -> Option<&SwapchainResources> {
        self.resources.as_ref()
    }

    pub fn image_count(&self) -> usize {
        self.resources.as_ref().map_or(0, |r| r.images.len())
    }

    /// Tear down and rebuild against freshly queried surface capabilities.
    /// Waits for the device to go idle first so no in-flight command buffer
    /// references the images being destroyed.
    pub fn recreate(
        &mut self,
        extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<()> {
        self.device.wait_idle()?;
        self.destroy_resources();
        self.resources = self.create_resources(extent, preferred_present_mode)?;
        Ok(())
    }

    /// Destroy everything owned by the current swapchain state, in
    /// dependency order. Idempotent; callers must have idled the device.
    pub fn destroy_resources(&mut self) {
        let Some(resources) = self.resources.take() else {
            return;
        };

        unsafe {
            for &framebuffer in &resources.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            self.device.device.destroy_render_pass(resources.render_pass, None);
            for frame in &resources.frames {
                frame.destroy(&self.device.device, self.command_pool);
            }
            for &view in &resources.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(resources.swapchain, None);
            // Depth image drops last
            drop(resources.depth);
        }
    }

    fn create_resources(
        &self,
        requested: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Option<SwapchainResources>> {
        // Minimized window: explicit empty state, image count 0
        if requested.width == 0 || requested.height == 0 {
            log::info!("Window minimized, suspending presentation");
            return Ok(None);
        }

        let device = &self.device;

        let surface_caps = unsafe {
            device.surface_loader.get_physical_device_surface_capabilities(
                device.physical_device,
                device.surface,
            )
        }?;

        let formats = unsafe {
            device.surface_loader.get_physical_device_surface_formats(
                device.physical_device,
                device.surface,
            )
        }?;

        let present_modes = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_present_modes(
                    device.physical_device,
                    device.surface,
                )
        }?;

        let surface_format = choose_surface_format(&formats)
            .ok_or(RendererError::InvalidArguments("surface reports no formats"))?;
        let present_mode = choose_present_mode(preferred_present_mode, &present_modes);
        let extent = choose_extent(&surface_caps, requested);

        // The surface itself can report a zero current extent while minimized
        if extent.width == 0 || extent.height == 0 {
            log::info!("Surface extent is zero, suspending presentation");
            return Ok(None);
        }

        let image_count = choose_image_count(&surface_caps);

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            image_count
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }?;

        let result = self.create_derived(swapchain, surface_format.format, extent);
        if result.is_err() {
            unsafe { self.loader.destroy_swapchain(swapchain, None) };
        }
        result.map(Some)
    }

    /// Build the objects derived from a fresh swapchain handle, bottom-up:
    /// views, depth buffer, render pass, framebuffers, frame slots.
    fn create_derived(
        &self,
        swapchain: vk::SwapchainKHR,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<SwapchainResources> {
        let device = &self.device;

        let images = unsafe { self.loader.get_swapchain_images(swapchain) }?;

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { device.device.create_image_view(&create_info, None) };
            match view {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    self.destroy_views(&image_views);
                    return Err(e.into());
                }
            }
        }

        let depth_format = choose_depth_format(|candidate| unsafe {
            device
                .instance
                .get_physical_device_format_properties(device.physical_device, candidate)
        })
        .ok_or(RendererError::NoSupportedDepthFormat);

        let depth_format = match depth_format {
            Ok(format) => format,
            Err(e) => {
                self.destroy_views(&image_views);
                return Err(e);
            }
        };

        let depth = GpuImage::new(
            device.clone(),
            extent,
            depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            depth_aspect_mask(depth_format),
        );
        let depth = match depth {
            Ok(depth) => depth,
            Err(e) => {
                self.destroy_views(&image_views);
                return Err(e);
            }
        };

        let render_pass = match pipeline::create_render_pass(device, format, depth_format) {
            Ok(render_pass) => render_pass,
            Err(e) => {
                self.destroy_views(&image_views);
                return Err(e);
            }
        };

        let framebuffers =
            pipeline::create_framebuffers(device, &image_views, depth.view, render_pass, extent);
        let framebuffers = match framebuffers {
            Ok(framebuffers) => framebuffers,
            Err(e) => {
                unsafe { device.device.destroy_render_pass(render_pass, None) };
                self.destroy_views(&image_views);
                return Err(e);
            }
        };

        // One frame slot per image, created with the swapchain and
        // destroyed with it
        let mut frames = Vec::with_capacity(images.len());
        for _ in 0..images.len() {
            match FrameSlot::new(device, self.command_pool) {
                Ok(slot) => frames.push(slot),
                Err(e) => {
                    for slot in &frames {
                        slot.destroy(&device.device, self.command_pool);
                    }
                    for &framebuffer in &framebuffers {
                        unsafe { device.device.destroy_framebuffer(framebuffer, None) };
                    }
                    unsafe { device.device.destroy_render_pass(render_pass, None) };
                    self.destroy_views(&image_views);
                    return Err(e);
                }
            }
        }

        Ok(SwapchainResources {
            swapchain,
            images,
            image_views,
            format,
            extent,
            depth,
            render_pass,
            framebuffers,
            frames,
        })
    }

    fn destroy_views(&self, views: &[vk::ImageView]) {
        for &view in views {
            unsafe { self.device.device.destroy_image_view(view, None) };
        }
    }

    /// Acquire the next image for rendering. Out-of-date and suboptimal are
    /// recreate signals, not errors.
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> Result<Acquire> {
        let resources = self
            .resources
            .as_ref()
            .ok_or(RendererError::InvalidArguments("acquire on an empty swapchain"))?;

        let result = unsafe {
            self.loader.acquire_next_image(
                resources.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Present a rendered image. Returns true when the swapchain needs
    /// recreation. Callers must hold the queue submission guard.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let resources = self
            .resources
            .as_ref()
            .ok_or(RendererError::InvalidArguments("present on an empty swapchain"))?;

        let swapchains = [resources.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.destroy_resources();
    }
}

/// Prefer an 8-bit sRGB format; fall back to whatever the surface reports.
pub(crate) fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// The configured preference if supported, then MAILBOX (low-latency triple
/// buffering), then FIFO which is always available.
pub(crate) fn choose_present_mode(
    preferred: vk::PresentModeKHR,
    modes: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        return preferred;
    }
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        return vk::PresentModeKHR::MAILBOX;
    }
    vk::PresentModeKHR::FIFO
}

/// Clamp the requested extent to the surface limits, unless the surface
/// dictates its extent exactly.
pub(crate) fn choose_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: requested.width.clamp(
            caps.min_image_extent.width,
            caps.max_image_extent.width,
        ),
        height: requested.height.clamp(
            caps.min_image_extent.height,
            caps.max_image_extent.height,
        ),
    }
}

/// Minimum-plus-one images, clamped to the surface maximum, never fewer
/// than two.
pub(crate) fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        count = caps.max_image_count;
    }
    count.max(2)
}

/// Combined depth-stencil formats need the stencil aspect in their views.
pub(crate) fn depth_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// First candidate depth format supporting depth-stencil attachment usage
/// under optimal tiling.
pub(crate) fn choose_depth_format(
    lookup: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    DEPTH_FORMAT_CANDIDATES.into_iter().find(|&format| {
        lookup(format)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.min_image_count = min;
        caps.max_image_count = max;
        caps.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        caps.min_image_extent = vk::Extent2D {
            width: 16,
            height: 16,
        };
        caps.max_image_extent = vk::Extent2D {
            width: 4096,
            height: 4096,
        };
        caps
    }

    #[test]
    fn prefers_bgra_srgb_format() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_reported_format() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        }];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R16G16B16A16_SFLOAT);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_prefers_configured_then_mailbox_then_fifo() {
        let all = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(
            choose_present_mode(vk::PresentModeKHR::IMMEDIATE, &all),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(vk::PresentModeKHR::IMMEDIATE, &all[1..]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(vk::PresentModeKHR::MAILBOX, &[vk::PresentModeKHR::FIFO]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_is_clamped_to_surface_limits() {
        let caps = caps(2, 0);
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 8000,
                height: 4,
            },
        );
        assert_eq!(extent.width, 4096);
        assert_eq!(extent.height, 16);
    }

    #[test]
    fn fixed_surface_extent_wins_over_request() {
        let mut caps = caps(2, 0);
        caps.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 1,
                height: 1,
            },
        );
        assert_eq!(extent.width, 800);
        assert_eq!(extent.height, 600);
    }

    #[test]
    fn image_count_is_at_least_double_buffered() {
        // A surface reporting a single-image minimum still double-buffers
        assert_eq!(choose_image_count(&caps(1, 0)), 2);
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
        // Clamped by the surface maximum
        assert_eq!(choose_image_count(&caps(2, 2)), 2);
    }

    #[test]
    fn combined_depth_formats_carry_the_stencil_aspect() {
        assert_eq!(
            depth_aspect_mask(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            depth_aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn depth_format_probe_takes_first_supported_candidate() {
        let supported = |formats: Vec<vk::Format>| {
            move |format: vk::Format| {
                let mut props = vk::FormatProperties::default();
                if formats.contains(&format) {
                    props.optimal_tiling_features =
                        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
                }
                props
            }
        };

        assert_eq!(
            choose_depth_format(supported(vec![
                vk::Format::D32_SFLOAT,
                vk::Format::D24_UNORM_S8_UINT
            ])),
            Some(vk::Format::D32_SFLOAT)
        );
        assert_eq!(
            choose_depth_format(supported(vec![vk::Format::D24_UNORM_S8_UINT])),
            Some(vk::Format::D24_UNORM_S8_UINT)
        );
        assert_eq!(choose_depth_format(supported(vec![])), None);
    }
}
