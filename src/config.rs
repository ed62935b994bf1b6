//! Configuration types for the live performance client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{LiveError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Backend endpoint settings.
    pub server: ServerConfig,
    /// Step stream reconnect behaviour.
    pub reconnect: ReconnectConfig,
    /// Audio playback settings.
    pub playback: PlaybackConfig,
    /// Avatar presentation settings.
    pub avatar: AvatarConfig,
}

/// Backend endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL for control requests, e.g. `http://localhost:8000`.
    pub base_url: String,
    /// Path of the step stream relative to the base URL.
    pub stream_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_owned(),
            stream_path: "/ws".to_owned(),
        }
    }
}

impl ServerConfig {
    /// WebSocket URL of the step stream.
    ///
    /// The scheme of `base_url` is mapped `http`→`ws` and `https`→`wss`;
    /// `ws`/`wss` base URLs are used as-is.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Config`] if the base URL cannot be parsed or uses
    /// an unsupported scheme.
    pub fn stream_url(&self) -> Result<String> {
        let mut url = url::Url::parse(self.base_url.trim())
            .map_err(|e| LiveError::Config(format!("invalid base_url '{}': {e}", self.base_url)))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(LiveError::Config(format!(
                    "unsupported base_url scheme '{other}'"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| LiveError::Config(format!("cannot use scheme '{scheme}'")))?;

        let path = if self.stream_path.starts_with('/') {
            self.stream_path.clone()
        } else {
            format!("/{}", self.stream_path)
        };
        url.set_path(&path);
        Ok(url.to_string())
    }
}

/// Reconnect backoff configuration for the step stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry, doubled on each consecutive failure.
    pub base_delay_ms: u64,
    /// Ceiling on the retry delay.
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter added to each delay.
    pub jitter_ms: u64,
    /// Interval between WebSocket keepalive pings.
    pub keepalive_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 800,
            max_delay_ms: 15_000,
            jitter_ms: 250,
            keepalive_secs: 30,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms))
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }
}

/// Audio playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Output sample rate in Hz. Decoded clips are resampled to this rate.
    pub sample_rate: u32,
    /// Maximum number of units waiting or decoding before new ones are refused.
    pub max_queue_depth: usize,
    /// Largest accepted encoded payload, in bytes of base64 text.
    pub max_payload_bytes: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            output_device: None,
            sample_rate: 24_000,
            max_queue_depth: 64,
            max_payload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Avatar presentation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    /// Character name used as caption prefix. Empty = no prefix.
    pub character_name: String,
}

impl LiveConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| LiveError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| LiveError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/encore/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("encore").join("config.toml")
        } else if let Some(dir) = dirs::config_dir() {
            dir.join("encore").join("config.toml")
        } else {
            PathBuf::from("/tmp/encore-config/config.toml")
        }
    }
}
