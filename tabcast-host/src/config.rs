//! Configuration for the tabcast host daemon.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use tabcast_core::encoder::{GAMING_BOOST_BITRATE_MBPS, GAMING_BOOST_QUALITY};
use tabcast_core::protocol::DEFAULT_PORT;

/// Refresh rate forced while gaming boost is on.
pub const GAMING_BOOST_REFRESH_HZ: u32 = 120;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Network settings.
    pub network: NetworkSettings,
    /// Virtual display geometry.
    pub display: DisplaySettings,
    /// Encoder and streaming settings.
    pub stream: StreamSettings,
    /// Touch input settings.
    pub input: InputSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// TCP port the streaming server listens on (1024–65535).
    pub port: u16,
}

/// Virtual display configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    /// Width of the virtual display in pixels.
    pub width: u32,
    /// Height of the virtual display in pixels.
    pub height: u32,
    /// Refresh rate (and capture/encode rate) in Hz.
    pub refresh_hz: u32,
    /// Rotation sent to the client: 0, 90, 180 or 270.
    pub rotation: i32,
}

/// Streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Target bitrate in megabits per second.
    pub bitrate_mbps: u32,
    /// Encoder quality hint (0.0–1.0).
    pub quality: f32,
    /// Override bitrate/quality/refresh with fixed high-performance
    /// values.
    pub gaming_boost: bool,
}

/// Touch input configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    /// Inject client touch gestures as host input.
    pub touch_enabled: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            network: NetworkSettings::default(),
            display: DisplaySettings::default(),
            stream: StreamSettings::default(),
            input: InputSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1200,
            refresh_hz: 120,
            rotation: 0,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            bitrate_mbps: 1000,
            quality: 0.8,
            gaming_boost: false,
        }
    }
}

impl Default for InputSettings {
    fn default() -> Self {
        Self { touch_enabled: true }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading / effective values ───────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        };
        config.normalized()
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, text)
    }

    /// Default config location in the user config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tabcast")
            .join("config.toml")
    }

    /// Reject out-of-range values, keeping the defaults instead.
    pub fn normalized(mut self) -> Self {
        if self.network.port != 0 && self.network.port < 1024 {
            tracing::warn!(
                port = self.network.port,
                "privileged port rejected; using {DEFAULT_PORT}"
            );
            self.network.port = DEFAULT_PORT;
        }
        if ![0, 90, 180, 270].contains(&self.display.rotation) {
            tracing::warn!(rotation = self.display.rotation, "invalid rotation; using 0");
            self.display.rotation = 0;
        }
        self.display.refresh_hz = self.display.refresh_hz.max(1);
        self.stream.quality = self.stream.quality.clamp(0.0, 1.0);
        self
    }

    /// Bitrate with the gaming-boost override applied.
    pub fn effective_bitrate(&self) -> u32 {
        if self.stream.gaming_boost {
            GAMING_BOOST_BITRATE_MBPS
        } else {
            self.stream.bitrate_mbps
        }
    }

    /// Quality with the gaming-boost override applied.
    pub fn effective_quality(&self) -> f32 {
        if self.stream.gaming_boost {
            GAMING_BOOST_QUALITY
        } else {
            self.stream.quality
        }
    }

    /// Refresh rate with the gaming-boost override applied.
    pub fn effective_refresh(&self) -> u32 {
        if self.stream.gaming_boost {
            GAMING_BOOST_REFRESH_HZ
        } else {
            self.display.refresh_hz
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&HostConfig::default()).unwrap();
        assert!(text.contains("port"));
        assert!(text.contains("refresh_hz"));
        assert!(text.contains("bitrate_mbps"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&HostConfig::default()).unwrap();
        let parsed: HostConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.port, DEFAULT_PORT);
        assert_eq!(parsed.display.width, 1920);
        assert_eq!(parsed.display.refresh_hz, 120);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: HostConfig = toml::from_str("[network]\nport = 9000\n").unwrap();
        assert_eq!(parsed.network.port, 9000);
        assert_eq!(parsed.display.height, 1200);
        assert!(parsed.input.touch_enabled);
    }

    #[test]
    fn normalization_rejects_bad_values() {
        let mut config = HostConfig::default();
        config.network.port = 80;
        config.display.rotation = 45;
        config.display.refresh_hz = 0;
        let config = config.normalized();

        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.display.rotation, 0);
        assert_eq!(config.display.refresh_hz, 1);
    }

    #[test]
    fn gaming_boost_overrides_stored_values() {
        let mut config = HostConfig::default();
        config.stream.bitrate_mbps = 200;
        config.stream.quality = 0.9;
        config.display.refresh_hz = 60;

        assert_eq!(config.effective_bitrate(), 200);

        config.stream.gaming_boost = true;
        assert_eq!(config.effective_bitrate(), GAMING_BOOST_BITRATE_MBPS);
        assert_eq!(config.effective_quality(), GAMING_BOOST_QUALITY);
        assert_eq!(config.effective_refresh(), GAMING_BOOST_REFRESH_HZ);
    }
}
