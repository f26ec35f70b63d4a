// Presentation surface - per-platform window connection
//
// Maps the raw window/display handles of the windowing layer onto the
// matching VK_KHR_*_surface extension.

use anyhow::Result;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

/// Instance extensions needed to present on this display
pub fn required_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => ash::extensions::khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => ash::extensions::khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => ash::extensions::khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => ash::extensions::khr::WaylandSurface::name(),
        other => anyhow::bail!("Unsupported display handle: {:?}", other),
    };
    Ok(vec![ash::extensions::khr::Surface::name(), platform])
}

/// Create a surface for the window.
///
/// # Safety
/// The handles must stay valid for the lifetime of the returned surface.
pub unsafe fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance =
                handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            ash::extensions::khr::Win32Surface::new(entry, instance)
                .create_win32_surface(&create_info, None)?
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let dpy = display
                .display
                .ok_or_else(|| anyhow::anyhow!("Xlib display handle is null"))?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr() as *mut _)
                .window(window.window);
            ash::extensions::khr::XlibSurface::new(entry, instance)
                .create_xlib_surface(&create_info, None)?
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let connection = display
                .connection
                .ok_or_else(|| anyhow::anyhow!("XCB connection handle is null"))?;
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr())
                .window(window.window.get());
            ash::extensions::khr::XcbSurface::new(entry, instance)
                .create_xcb_surface(&create_info, None)?
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(window.surface.as_ptr());
            ash::extensions::khr::WaylandSurface::new(entry, instance)
                .create_wayland_surface(&create_info, None)?
        }
        _ => anyhow::bail!("Unsupported window handle type"),
    };

    Ok(surface)
}
