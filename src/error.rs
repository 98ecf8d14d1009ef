// Error types for the rendering backend
//
// Fatal conditions abort initialization or the frame loop. Swapchain
// staleness (out of date / suboptimal) is never an error; it is reported
// through the needs-recreate path instead.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RendererError>;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("failed to load the Vulkan library: {0}")]
    EntryLoad(String),

    #[error("no graphics adapter exposes a graphics-capable queue family that can present to the surface")]
    NoCapableAdapter,

    #[error("no candidate depth format supports depth-stencil attachment usage on this adapter")]
    NoSupportedDepthFormat,

    #[error("surface creation is not supported on this windowing platform")]
    UnsupportedPlatform,

    #[error("failed to load shader {path:?}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("gpu allocation of {what} failed")]
    AllocationFailure {
        what: &'static str,
        #[source]
        source: vk::Result,
    },

    #[error("device lost: fence wait exceeded {timeout_ms} ms")]
    DeviceLost { timeout_ms: u64 },

    #[error("invalid arguments: {0}")]
    InvalidArguments(&'static str),

    #[error("stale or already destroyed handle")]
    StaleHandle,

    #[error("buffer memory is not host visible; resident buffers are written through the staging upload path")]
    NotHostVisible,

    #[error("unsupported image layout transition {from:?} -> {to:?}")]
    UnsupportedLayoutTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },

    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),
}
