// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub frame: FrameConfig,
    pub upload: UploadConfig,
    pub debug: DebugConfig,
    pub demo: DemoConfig,
}

/// Frame pacing settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// How many frames the GPU may lag behind the CPU (ring depth)
    pub frames_in_flight: usize,
    /// Most transitions that may be queued between two commits
    pub barrier_capacity: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            barrier_capacity: 256,
        }
    }
}

/// Upload ring settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Size of the per-frame upload ring in bytes
    pub ring_size: u64,
    /// Alignment of every upload allocation
    pub alignment: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            ring_size: 4 * 1024 * 1024,
            alignment: 256,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "state_tracker.log".to_string(),
        }
    }
}

/// Which device the demo drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Vulkan,
    Simulated,
}

/// Demo frame-loop settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub backend: BackendKind,
    pub frames: u64,
    pub texture_size: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    /// Simulated backend only: lose the device when this fence value is signaled
    pub device_loss_at_frame: Option<u64>,
    pub max_device_rebuilds: u32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Simulated,
            frames: 120,
            texture_size: 512,
            mip_levels: 4,
            array_layers: 1,
            device_loss_at_frame: None,
            max_device_rebuilds: 2,
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

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the frame driver cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.frame.frames_in_flight == 0 {
            anyhow::bail!("frame.frames_in_flight must be at least 1");
        }
        if self.frame.barrier_capacity == 0 {
            anyhow::bail!("frame.barrier_capacity must be at least 1");
        }
        if self.upload.ring_size == 0 {
            anyhow::bail!("upload.ring_size must be non-zero");
        }
        if !self.upload.alignment.is_power_of_two() || self.upload.ring_size % self.upload.alignment != 0 {
            anyhow::bail!(
                "upload.alignment ({}) must be a power of two dividing upload.ring_size ({})",
                self.upload.alignment,
                self.upload.ring_size
            );
        }
        if self.demo.mip_levels == 0 || self.demo.array_layers == 0 {
            anyhow::bail!("demo textures need at least one mip level and one array layer");
        }
        let full_chain = u32::BITS - self.demo.texture_size.leading_zeros();
        if self.demo.mip_levels > full_chain {
            anyhow::bail!(
                "demo.mip_levels ({}) exceeds the {} levels of a {} texel texture",
                self.demo.mip_levels,
                full_chain,
                self.demo.texture_size
            );
        }
        Ok(())
    }

    /// Log level filter, defaulting to Info for unknown names
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', defaulting to info", self.debug.log_level);
            log::LevelFilter::Info
        })
    }
}
