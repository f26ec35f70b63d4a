// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::lights::{RotatingView, SpotLight, MAX_LIGHTS};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub scene: SceneConfig,
    pub camera: RotatingView,
    pub lights: LightsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Deferred Renderer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub frames_in_flight: u32,
    pub fence_timeout_ms: u64,
    pub shadow_map_size: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            frames_in_flight: 3,
            fence_timeout_ms: 5_000,
            shadow_map_size: 1024,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "renderer_debug.log".to_string(),
            show_fps: true,
        }
    }
}

/// What to draw and where the compiled shaders live
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// BOBJ file; the procedural scene is drawn when absent
    pub model: Option<PathBuf>,
    pub shader_dir: PathBuf,
    /// Position the lighting pass shades from
    pub camera_position: [f32; 3],
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            model: None,
            shader_dir: PathBuf::from("shaders"),
            camera_position: [1000.0, 100.0, 0.0],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LightsConfig {
    pub spot: Vec<SpotLight>,
}

impl Default for LightsConfig {
    fn default() -> Self {
        Self {
            spot: SpotLight::demo_set(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.sanitize();
        Ok(config)
    }

    fn sanitize(&mut self) {
        if self.lights.spot.len() > MAX_LIGHTS {
            log::warn!(
                "{} lights configured, only the first {} are used",
                self.lights.spot.len(),
                MAX_LIGHTS
            );
            self.lights.spot.truncate(MAX_LIGHTS);
        }
        if self.graphics.frames_in_flight == 0 {
            log::warn!("frames_in_flight must be at least 1, using 1");
            self.graphics.frames_in_flight = 1;
        }
        if self.graphics.shadow_map_size == 0 {
            log::warn!("shadow_map_size must be positive, using 1024");
            self.graphics.shadow_map_size = 1024;
        }
    }

    pub fn fence_timeout_ns(&self) -> u64 {
        self.graphics.fence_timeout_ms.saturating_mul(1_000_000)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.graphics.frames_in_flight, 3);
        assert_eq!(config.graphics.shadow_map_size, 1024);
        assert_eq!(config.lights.spot.len(), 4);
        assert!(config.scene.model.is_none());
        assert_eq!(config.camera.far, 2500.0);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
            [graphics]
            present_mode = "mailbox"

            [camera]
            fov = 0.8
            "#,
        )
        .unwrap();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.graphics.frames_in_flight, 3);
        assert_eq!(config.camera.fov, 0.8);
        assert_eq!(config.camera.near, 10.0);
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn test_light_list_is_replaced_and_clamped() {
        let mut toml = String::new();
        for i in 0..20 {
            toml.push_str(&format!("[[lights.spot]]\nposition = [{i}.0, 50.0, 0.0]\n"));
        }
        let config = Config::parse(&toml).unwrap();
        assert_eq!(config.lights.spot.len(), MAX_LIGHTS);
        assert_eq!(config.lights.spot[3].position, Vec3::new(3.0, 50.0, 0.0));
        // Unspecified fields come from the light defaults
        assert_eq!(config.lights.spot[3].attenuation, Vec3::new(1.0, 0.5, 0.02));
    }

    #[test]
    fn test_invalid_values_are_sanitized() {
        let text = "[graphics]\nframes_in_flight = 0\nshadow_map_size = 0\n";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.graphics.frames_in_flight, 1);
        assert_eq!(config.graphics.shadow_map_size, 1024);
    }

    #[test]
    fn test_unknown_present_mode_falls_back_to_fifo() {
        let config = Config::parse("[graphics]\npresent_mode = \"warp\"\n").unwrap();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::FIFO);
        assert_eq!(config.fence_timeout_ns(), 5_000_000_000);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        assert!(Config::parse("[graphics\n").is_err());
    }
}
