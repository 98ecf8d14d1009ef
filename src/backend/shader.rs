// Shader module loading
//
// The backend consumes precompiled SPIR-V blobs by path. Load failure is
// fatal at initialization time.

use ash::vk;
use std::path::Path;

use super::VulkanDevice;
use crate::error::{RendererError, Result};

/// Load a SPIR-V blob from disk and create a shader module from it.
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path).map_err(|e| RendererError::ShaderLoad {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut cursor = std::io::Cursor::new(bytes);
    let code = ash::util::read_spv(&mut cursor).map_err(|e| RendererError::ShaderLoad {
        path: path.to_path_buf(),
        source: e,
    })?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

    let module = unsafe { device.device.create_shader_module(&create_info, None) }?;
    Ok(module)
}
