// Presentation surface creation from raw window handles
//
// The host owns the window; the backend only consumes its raw display and
// window handles. Supported platforms: Win32, Xlib, Wayland.

use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::os::raw::c_char;

use crate::error::{RendererError, Result};

/// Instance extensions required to present to a surface on this platform.
pub fn required_extension_names(display: RawDisplayHandle) -> Result<Vec<*const c_char>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        _ => return Err(RendererError::UnsupportedPlatform),
    };

    Ok(vec![khr::Surface::name().as_ptr(), platform.as_ptr()])
}

/// Create a surface for the window behind the raw handles.
///
/// # Safety
/// The handles must refer to a live window that outlives the surface.
pub unsafe fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance =
                handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            let loader = khr::Win32Surface::new(entry, instance);
            Ok(loader.create_win32_surface(&create_info, None)?)
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .map(|d| d.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy as *mut _)
                .window(handle.window);
            let loader = khr::XlibSurface::new(entry, instance);
            Ok(loader.create_xlib_surface(&create_info, None)?)
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(handle.surface.as_ptr());
            let loader = khr::WaylandSurface::new(entry, instance);
            Ok(loader.create_wayland_surface(&create_info, None)?)
        }
        _ => Err(RendererError::UnsupportedPlatform),
    }
}
