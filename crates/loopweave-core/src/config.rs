//! Configuration file support for LoopWeave.
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/loopweave/config.toml`
//! - macOS: `~/Library/Application Support/loopweave/config.toml`
//! - Windows: `%APPDATA%\loopweave\config.toml`
//!
//! Every field has a default, so a partial file (or none at all) is fine.

use crate::error::{Error, Result};
use crate::resolver::SyncPolicy;
use crate::sync::SyncMode;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default restart skew compensation in milliseconds.
pub const DEFAULT_RESTART_SKEW_MS: f64 = 30.0;
/// Default sync poll interval in milliseconds.
pub const DEFAULT_SYNC_POLL_INTERVAL_MS: u64 = 50;
/// Default extension appended to decision-tree track names.
pub const DEFAULT_EXTENSION: &str = ".wav";
/// Default cycle length, in milliseconds, for files whose length cannot be read.
pub const DEFAULT_UNREADABLE_LENGTH_MS: u64 = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Loop timing
    pub timing: TimingSettings,
    /// Cross-track synchronization
    pub sync: SyncSettings,
    /// Where audio files live
    pub sounds: SoundSettings,
}

/// Loop timing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Milliseconds subtracted from a loop's duration when arming its restart
    /// timer, compensating for dispatch latency.
    pub restart_skew_ms: f64,
    /// Interval between boundary re-checks in poll sync mode.
    pub sync_poll_interval_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            restart_skew_ms: DEFAULT_RESTART_SKEW_MS,
            sync_poll_interval_ms: DEFAULT_SYNC_POLL_INTERVAL_MS,
        }
    }
}

impl TimingSettings {
    /// Restart skew as a duration. Negative or invalid values mean no skew.
    pub fn restart_skew(&self) -> Duration {
        if self.restart_skew_ms.is_finite() && self.restart_skew_ms > 0.0 {
            Duration::from_micros((self.restart_skew_ms * 1000.0).round() as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Poll interval as a duration.
    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }
}

/// Synchronization settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// How parked sync requests wait for the reference boundary.
    pub mode: SyncMode,
    /// Reference selection policy. When unset, the player picks one per
    /// scenario kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<SyncPolicy>,
}

/// Audio file settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundSettings {
    /// Directory track ids are resolved against. Defaults to the scenario's directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Extension appended to decision-tree track names.
    pub extension: String,
    /// How long one cycle of an unreadable file lasts before it reports its end.
    pub unreadable_length_ms: u64,
}

impl Default for SoundSettings {
    fn default() -> Self {
        Self {
            dir: None,
            extension: DEFAULT_EXTENSION.to_string(),
            unreadable_length_ms: DEFAULT_UNREADABLE_LENGTH_MS,
        }
    }
}

impl SoundSettings {
    /// Cycle length of unreadable files. Never zero.
    pub fn unreadable_length(&self) -> Duration {
        Duration::from_millis(self.unreadable_length_ms.max(1))
    }
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(Error::Config(_)) => Self::default(),
            Err(e) => {
                log::warn!("Ignoring unreadable config file: {}", e);
                Self::default()
            }
        }
    }

    /// Serialize to TOML text
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "loopweave") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Write a default config file with comments to `path`
    pub fn write_default_config_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_CONFIG_FILE)?;
        Ok(())
    }

    /// Create a default config file with comments at the default location
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        Self::write_default_config_file(&path)?;
        Ok(path)
    }
}

const DEFAULT_CONFIG_FILE: &str = r#"# loopweave configuration file

[timing]
# Milliseconds subtracted from each loop's length when scheduling its restart,
# so the next cycle is heard on time rather than late.
restart_skew_ms = 30.0

# How often a waiting loop re-checks its reference track (sync mode "poll").
sync_poll_interval_ms = 50

[sync]
# "event": start as soon as the reference track reports its next cycle
# "poll":  re-check the reference track every sync_poll_interval_ms
mode = "event"

# Which playing track a new loop aligns to:
# "global-latest" or "nearest-prior-step". Unset = decided per scenario kind.
# policy = "global-latest"

[sounds]
# Directory containing the audio files. Unset = next to the scenario file.
# dir = "/path/to/sounds"

# Appended to track names used in decision-tree actions ("+forest" -> "forest.wav")
extension = ".wav"

# Files that cannot be read still loop silently, ending every
# unreadable_length_ms milliseconds.
unreadable_length_ms = 1000
"#;
