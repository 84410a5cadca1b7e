//! Configuration for the Blight session daemon
//!
//! Loads configuration from TOML file at `~/.config/blight/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use blight_proto::PixelFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub display: DisplayConfig,
    pub keepalive: KeepaliveConfig,
    pub supervisor: SupervisorConfig,
    pub input: InputConfig,
    pub bus: BusConfig,
}

impl Config {
    /// Load configuration from the default location, writing the defaults
    /// there if the file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("blight");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Framebuffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Framebuffer device; a missing device runs the compositor headless
    pub framebuffer: PathBuf,
    /// Issue EPDC refresh ioctls on the framebuffer device
    pub epdc: bool,
    pub width: i32,
    pub height: i32,
    /// Bytes per framebuffer row, 0 = derived from width and format
    pub stride: i32,
    /// Pixel format number (see `PixelFormat`)
    pub format: i32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            framebuffer: PathBuf::from("/dev/fb0"),
            epdc: true,
            width: 1404,
            height: 1872,
            stride: 0,
            format: PixelFormat::Rgb16.as_raw(),
        }
    }
}

impl DisplayConfig {
    pub fn pixel_format(&self) -> PixelFormat {
        PixelFormat::from_raw(self.format).unwrap_or_else(|| {
            warn!("Unknown framebuffer format {}, using RGB16", self.format);
            PixelFormat::Rgb16
        })
    }

    pub fn row_stride(&self) -> i32 {
        if self.stride > 0 {
            return self.stride;
        }
        let bpp = self.pixel_format().bytes_per_pixel().unwrap_or(2);
        self.width * bpp as i32
    }
}

/// Data-plane keepalive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Interval between pings (milliseconds)
    pub interval_ms: u64,
    /// Close a connection whose ping stays unanswered this long (milliseconds)
    pub timeout_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            timeout_ms: 15000,
        }
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Pause/resume negotiation and termination
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How long a child has to acknowledge a pause/resume request (milliseconds)
    pub ack_timeout_ms: u64,
    /// Bound on waiting for the kernel to confirm a stop/continue (milliseconds)
    pub stop_timeout_ms: u64,
    /// Time between SIGTERM and SIGKILL (milliseconds)
    pub terminate_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 1000,
            stop_timeout_ms: 1000,
            terminate_grace_ms: 3000,
        }
    }
}

impl SupervisorConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Input devices forwarded to the focused client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// evdev device paths; the index in this list is the device id clients see
    pub devices: Vec<PathBuf>,
}

/// D-Bus connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Serve on the system bus instead of the session bus
    pub system: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roundtrip() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let config: Config = toml::from_str(&text).unwrap();
        assert_eq!(config.supervisor.ack_timeout_ms, 1000);
        assert_eq!(config.display.format, PixelFormat::Rgb16.as_raw());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[keepalive]\ninterval_ms = 250\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.keepalive.interval(), Duration::from_millis(250));
        assert_eq!(config.keepalive.timeout_ms, 15000);
        assert_eq!(config.display.width, 1404);
        assert!(!config.bus.system);
    }

    #[test]
    fn test_save_default_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        Config::save_default(&path).unwrap();
        assert!(Config::load_from(&path).is_ok());
    }

    #[test]
    fn test_stride_derived_from_format() {
        let display = DisplayConfig {
            width: 100,
            format: PixelFormat::Grayscale8.as_raw(),
            ..DisplayConfig::default()
        };
        assert_eq!(display.row_stride(), 100);
        let display = DisplayConfig {
            stride: 260,
            ..display
        };
        assert_eq!(display.row_stride(), 260);
    }
}
