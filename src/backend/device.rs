// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Presentation surface creation
// - Physical device selection (largest device-local memory wins)
// - Logical device + queue creation

use ash::{vk, Entry};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::surface;
use crate::error::{RendererError, Result};

/// Vulkan device wrapper with automatic cleanup.
///
/// Exclusively owns the instance, surface, and logical device; every other
/// backend object holds a non-owning `Arc` reference.
pub struct VulkanDevice {
    // Vulkan handles (order matters for drop!)
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Presentation surface, shared read-only with the swapchain
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::extensions::khr::Surface,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    /// Serializes every queue submission. The device exposes a single
    /// graphics/present queue, and one-time uploads may run from any thread;
    /// without this lock concurrent submissions would race on the queue.
    pub submit_lock: Mutex<()>,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Create the Vulkan device and presentation surface.
    ///
    /// Failure here is fatal to the application; there is no degraded-mode
    /// fallback.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .map_err(|e| RendererError::EntryLoad(e.to_string()))?;

        // Step 2: Create instance with exactly the extensions presentation needs
        let instance = Self::create_instance(&entry, app_name, enable_validation, display_handle)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Create the presentation surface
        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);
        let surface =
            unsafe { surface::create_surface(&entry, &instance, display_handle, window_handle)? };

        // Step 5: Pick physical device (GPU)
        let (physical_device, graphics_queue_family) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        // Step 6: Create logical device
        let (device, graphics_queue) =
            Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {} ({} MiB device-local)",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            device_local_bytes(&memory_properties) / (1024 * 1024)
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            graphics_queue,
            graphics_queue_family,
            submit_lock: Mutex::new(()),
            debug_utils,
            properties,
            memory_properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr =
            CString::new(app_name).map_err(|_| RendererError::InvalidArguments("app name"))?;
        let engine_name = CString::new("kiln").expect("static engine name");

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions = surface::required_extension_names(display_handle)?;
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    /// Select the adapter with the most device-local memory among adapters
    /// exposing a queue family that is both graphics-capable and able to
    /// present to the surface. Ties break on enumeration order.
    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        let mut best: Option<(vk::PhysicalDevice, u32, u64)> = None;

        for device in devices {
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let mut graphics_family = None;
            for (index, family) in queue_families.iter().enumerate() {
                if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                    continue;
                }
                let present_support = unsafe {
                    surface_loader.get_physical_device_surface_support(
                        device,
                        index as u32,
                        surface,
                    )
                }?;
                if present_support {
                    graphics_family = Some(index as u32);
                    break;
                }
            }

            let Some(graphics_family) = graphics_family else {
                continue;
            };

            let memory_properties =
                unsafe { instance.get_physical_device_memory_properties(device) };
            let local = device_local_bytes(&memory_properties);

            // Strictly greater keeps the first enumerated adapter on ties
            if best.as_ref().map_or(true, |&(_, _, size)| local > size) {
                best = Some((device, graphics_family, local));
            }
        }

        best.map(|(device, family, _)| (device, family))
            .ok_or(RendererError::NoCapableAdapter)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        // Exactly the extensions required for presentation
        let extensions = vec![ash::extensions::khr::Swapchain::name().as_ptr()];

        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    /// Wait for the device to go idle (e.g. before recreation or cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for the GPU to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order: surface, device, messenger, instance
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Total size of all device-local memory heaps on an adapter.
pub(crate) fn device_local_bytes(memory: &vk::PhysicalDeviceMemoryProperties) -> u64 {
    memory.memory_heaps[..memory.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum()
}

// Debug callback for validation layers; forwards diagnostics to the logger
// without altering control flow.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heaps(sizes: &[(u64, bool)]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_heap_count = sizes.len() as u32;
        for (i, &(size, local)) in sizes.iter().enumerate() {
            props.memory_heaps[i] = vk::MemoryHeap {
                size,
                flags: if local {
                    vk::MemoryHeapFlags::DEVICE_LOCAL
                } else {
                    vk::MemoryHeapFlags::empty()
                },
            };
        }
        props
    }

    #[test]
    fn device_local_bytes_sums_only_local_heaps() {
        let props = heaps(&[(8 << 30, true), (16 << 30, false), (256 << 20, true)]);
        assert_eq!(device_local_bytes(&props), (8 << 30) + (256 << 20));
    }

    #[test]
    fn device_local_bytes_zero_when_no_local_heap() {
        let props = heaps(&[(4 << 30, false)]);
        assert_eq!(device_local_bytes(&props), 0);
    }
}
