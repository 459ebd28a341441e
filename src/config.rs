// Configuration management for camview

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Requested capture format
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Capture/decode pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// External capture process (rpicam-vid) supervision
    #[serde(default)]
    pub external: ExternalSourceConfig,

    /// Render tick and statistics
    #[serde(default)]
    pub presentation: PresentationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            framerate: default_framerate(),
        }
    }
}

/// What the capture stage does when the queue to the decoder is full
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the frame that was just captured
    #[default]
    DropNewest,
    /// Discard the oldest queued frame to make room
    EvictOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Frames buffered between capture and decode
    #[serde(default = "default_capture_queue_capacity")]
    pub capture_queue_capacity: usize,

    /// How long one `next_frame` call may block
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,

    /// Decode thread dequeue timeout (how often it rechecks `active`)
    #[serde(default = "default_decode_timeout_ms")]
    pub decode_timeout_ms: u64,

    /// How long deactivate waits for the pipeline threads to exit
    #[serde(default = "default_deactivate_grace_ms")]
    pub deactivate_grace_ms: u64,

    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_queue_capacity: default_capture_queue_capacity(),
            frame_timeout_ms: default_frame_timeout_ms(),
            decode_timeout_ms: default_decode_timeout_ms(),
            deactivate_grace_ms: default_deactivate_grace_ms(),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }

    pub fn deactivate_grace(&self) -> Duration {
        Duration::from_millis(self.deactivate_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalSourceConfig {
    /// Capture program that writes MJPEG to stdout
    #[serde(default = "default_external_program")]
    pub program: String,

    /// Whether discovery probes the program for cameras
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Restart the process after this long without a frame
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,

    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    #[serde(default = "default_max_restart_delay_ms")]
    pub max_restart_delay_ms: u64,

    /// Runs in a row without a single frame before the source is failed
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Frames buffered between the stdout reader and the capture thread
    #[serde(default = "default_external_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ExternalSourceConfig {
    fn default() -> Self {
        Self {
            program: default_external_program(),
            enabled: true,
            watchdog_secs: default_watchdog_secs(),
            restart_delay_ms: default_restart_delay_ms(),
            max_restart_delay_ms: default_max_restart_delay_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            queue_capacity: default_external_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresentationConfig {
    /// Render tick period
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// How often per-source statistics are logged (0 disables)
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl PresentationConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Error type for loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Load config from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load config from disk or return default
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("{}", e);
                Self::default()
            }
        }
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("camview")
        .join("config.toml")
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_framerate() -> u32 {
    30
}

fn default_capture_queue_capacity() -> usize {
    5
}

fn default_frame_timeout_ms() -> u64 {
    1000
}

fn default_decode_timeout_ms() -> u64 {
    100
}

fn default_deactivate_grace_ms() -> u64 {
    1500
}

fn default_external_program() -> String {
    "rpicam-vid".to_string()
}

fn default_watchdog_secs() -> u64 {
    5
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_max_restart_delay_ms() -> u64 {
    8000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_external_queue_capacity() -> usize {
    10
}

fn default_tick_ms() -> u64 {
    16
}

fn default_stats_interval_secs() -> u64 {
    5
}

/// Default true value (for serde)
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.capture.width = 1280;
        config.capture.height = 720;
        config.pipeline.overflow_policy = OverflowPolicy::EvictOldest;
        config.external.enabled = false;
        config.save(&path).unwrap();

        assert_eq!(Config::load_or_default(&path), config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pipeline]\ncapture_queue_capacity = 8\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pipeline.capture_queue_capacity, 8);
        assert_eq!(config.pipeline.frame_timeout_ms, 1000);
        assert_eq!(config.pipeline.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.external.program, "rpicam-vid");
        assert_eq!(config.capture, CaptureConfig::default());
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "pipeline = [not toml").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
        assert_eq!(Config::load_or_default(&path), Config::default());
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            Config::load_or_default(&dir.path().join("absent.toml")),
            Config::default()
        );
    }

    #[test]
    fn overflow_policy_serializes_snake_case() {
        let toml = toml::to_string(&PipelineConfig {
            overflow_policy: OverflowPolicy::EvictOldest,
            ..PipelineConfig::default()
        })
        .unwrap();
        assert!(toml.contains("overflow_policy = \"evict_oldest\""));
    }
}
