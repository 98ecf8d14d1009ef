// Configuration loaded from config.toml
//
// Provides sensible defaults if the config file is missing or has errors.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
}

/// Window settings for the demo host
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "kiln".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.05, 0.07, 0.12, 1.0],
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
        }
    }
}

/// Paths to precompiled SPIR-V shader blobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/item.vert.spv"),
            fragment: PathBuf::from("shaders/item.frag.spv"),
        }
    }
}

impl Config {
    /// Load configuration from config.toml, falling back to defaults
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);

        Ok(config)
    }

    /// Preferred present mode as a Vulkan enum. The swapchain falls back to
    /// MAILBOX and then FIFO when the preference is unsupported.
    pub fn preferred_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::MAILBOX
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.present_mode, "mailbox");
        assert!(config.debug.validation_layers);
        assert_eq!(config.shaders.vertex, PathBuf::from("shaders/item.vert.spv"));
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [window]
            width = 640
            height = 480

            [graphics]
            present_mode = "fifo"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 640);
        assert_eq!(config.preferred_present_mode(), vk::PresentModeKHR::FIFO);
        // Untouched sections keep their defaults
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_mailbox() {
        let mut config = Config::default();
        config.graphics.present_mode = "warp-speed".to_string();
        assert_eq!(config.preferred_present_mode(), vk::PresentModeKHR::MAILBOX);
    }
}
