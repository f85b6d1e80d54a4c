// Configuration management for Camcast

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::devices::capabilities::NegotiatedFormat;
use crate::devices::selection::TEST_SOURCE;

/// Error type for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no usable source candidates: candidate list is empty and the test source is not allowed")]
    NoSources,

    #[error("liveliness timeout must be greater than zero")]
    InvalidLiveliness,

    #[error("invalid fixed format: {0}")]
    InvalidFixedFormat(String),

    #[error("channel name must not be empty")]
    EmptyChannelName,

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A fixed capture format forced by the operator, bypassing negotiation.
///
/// Used when a downstream decoder only copes with one known-good mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixedFormat {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_fps_num")]
    pub fps_num: i32,
    #[serde(default = "default_fps_den")]
    pub fps_den: i32,
    /// Pixel format string (e.g. "I420"). None lets the converter decide.
    #[serde(default)]
    pub pixel_format: Option<String>,
}

fn default_fps_num() -> i32 {
    30
}

fn default_fps_den() -> i32 {
    1
}

impl FixedFormat {
    pub fn to_negotiated(&self) -> NegotiatedFormat {
        NegotiatedFormat {
            pixel_format: self.pixel_format.clone(),
            width: self.width,
            height: self.height,
            fps_num: self.fps_num,
            fps_den: self.fps_den,
        }
    }
}

/// Publisher process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Logical channel all redundant publishers share
    #[serde(default = "default_channel_name")]
    pub channel_name: String,

    /// Ownership strength of this instance. Must be unique across the
    /// redundant publishers on one channel; the highest live strength owns
    /// the channel.
    #[serde(default)]
    pub strength: i32,

    /// Maximum silence before this publisher is considered dead by
    /// subscribers and ownership passes on
    #[serde(default = "default_liveliness_ms")]
    pub liveliness_timeout_ms: u64,

    /// Capture source factory names, highest priority first
    #[serde(default = "default_source_candidates")]
    pub source_candidates: Vec<String>,

    /// Whether the synthetic test source may be selected
    #[serde(default)]
    pub allow_test_source: bool,

    /// Use the hardware-accelerated encoder instead of x264.
    /// No silent fallback: startup fails when it is unavailable.
    #[serde(default)]
    pub use_hardware_encoder: bool,

    /// Optional operator-forced capture format (skips negotiation)
    #[serde(default)]
    pub fixed_format: Option<FixedFormat>,
}

fn default_channel_name() -> String {
    "VideoStream".to_string()
}

fn default_liveliness_ms() -> u64 {
    1000
}

fn default_source_candidates() -> Vec<String> {
    vec!["ksvideosrc".to_string(), "v4l2src".to_string()]
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            channel_name: default_channel_name(),
            strength: 0,
            liveliness_timeout_ms: default_liveliness_ms(),
            source_candidates: default_source_candidates(),
            allow_test_source: false,
            use_hardware_encoder: false,
            fixed_format: None,
        }
    }
}

impl PublisherConfig {
    /// Default config file location (`<config dir>/camcast/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("camcast").join("config.toml"))
    }

    /// Load configuration from the given file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path` if given, else from the default location if present,
    /// else fall back to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(default) if default.exists() => Self::load(&default),
            _ => Ok(Self::default()),
        }
    }

    /// Validate before any pipeline or bus resource is created.
    pub fn validate(&self) -> Result<()> {
        if self.channel_name.is_empty() {
            return Err(ConfigError::EmptyChannelName);
        }
        if self.liveliness_timeout_ms == 0 {
            return Err(ConfigError::InvalidLiveliness);
        }
        let has_real_candidate = self
            .source_candidates
            .iter()
            .any(|c| c != TEST_SOURCE && !c.is_empty());
        if !has_real_candidate && !self.allow_test_source {
            return Err(ConfigError::NoSources);
        }
        if let Some(fixed) = &self.fixed_format {
            if fixed.width == 0 || fixed.height == 0 {
                return Err(ConfigError::InvalidFixedFormat(format!(
                    "resolution {}x{} is not valid",
                    fixed.width, fixed.height
                )));
            }
            if fixed.fps_num <= 0 || fixed.fps_den <= 0 {
                return Err(ConfigError::InvalidFixedFormat(format!(
                    "framerate {}/{} is not valid",
                    fixed.fps_num, fixed.fps_den
                )));
            }
        }
        Ok(())
    }
}
