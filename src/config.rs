//! Configuration for the tether client
//!
//! Loads configuration from TOML file at `~/.config/tether/config.toml`,
//! or from the path in `TETHER_CONFIG` when set.
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub frame: FrameConfig,
    pub input: InputConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from `config_path`, writing defaults there if
    /// the file is missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(config_path) {
                warn!("Failed to create default config file: {:#}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file {:?}", config_path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", config_path))?;
        config.validate()?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }

        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("tether");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string)
            .context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.frame.rate_hz > 0.0 && self.frame.rate_hz.is_finite(),
            "frame.rate_hz must be a positive number, got {}",
            self.frame.rate_hz
        );
        anyhow::ensure!(
            self.window.width > 0 && self.window.height > 0,
            "window size must be non-zero, got {}x{}",
            self.window.width,
            self.window.height
        );
        Ok(())
    }
}

/// Window configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Toplevel title
    pub title: String,
    /// Initial width in pixels, used until the compositor configures one
    pub width: u32,
    /// Initial height in pixels
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "tether".to_string(),
            width: 640,
            height: 480,
        }
    }
}

/// Frame loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Target frames per second
    pub rate_hz: f64,
    /// Stop after this many frames (unset = run until closed)
    pub max_frames: Option<u64>,
    /// FPS report interval in milliseconds
    pub report_interval_ms: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            rate_hz: 60.0,
            max_frames: None,
            report_interval_ms: 5000,
        }
    }
}

/// Input logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Log pointer, touch and tool motion at info level (trace otherwise)
    pub log_motion: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self { log_motion: false }
    }
}

/// Simulated compositor session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Whether the display accepts the connection
    pub available: bool,
    /// Seat offers a touch screen
    pub touch: bool,
    /// Advertise a drawing tablet with one stylus
    pub tablet: bool,
    /// Compositor asks the window to close at this frame
    pub close_at_frame: Option<u64>,
    /// Connection drops at this frame
    pub disconnect_at_frame: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            available: true,
            touch: true,
            tablet: true,
            close_at_frame: Some(600),
            disconnect_at_frame: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());

        // The generated file loads back to the same configuration
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[window]\ntitle = \"demo\"\n\n[frame]\nmax_frames = 10\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.window.title, "demo");
        assert_eq!(config.window.width, 640);
        assert_eq!(config.frame.max_frames, Some(10));
        assert_eq!(config.frame.rate_hz, 60.0);
        assert!(config.session.available);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[frame]\nrate_hz = 0.0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("rate_hz"));
    }

    #[test]
    fn test_malformed_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[window\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
