//! kiln - a Vulkan rendering backend
//!
//! Owns the graphics device, the presentation swapchain, per-frame
//! synchronization, and the staging upload pipeline. The host application
//! owns the window and event loop, forwards resize notifications and raw
//! window handles in, and drives `begin_frame` / `end_frame`.
//!
//! ```no_run
//! # use kiln::{Config, Renderer, RenderItemDesc};
//! # fn demo(display: raw_window_handle::RawDisplayHandle,
//! #         window: raw_window_handle::RawWindowHandle) -> kiln::Result<()> {
//! let mut renderer = Renderer::new(Config::load(), display, window)?;
//! let item = renderer.create_render_item(&RenderItemDesc {
//!     vertices: &[0u8; 96],
//!     indices: &[0u8; 12],
//!     texture: None,
//! })?;
//! if renderer.begin_frame()? {
//!     renderer.end_frame(glam::Mat4::IDENTITY)?;
//! }
//! renderer.destroy_render_item(item)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod item;
pub mod renderer;

pub use config::Config;
pub use error::{RendererError, Result};
pub use item::{RenderItemDesc, RenderItemKey, TextureKey, Vertex};
pub use renderer::Renderer;
