use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_frames_dir")]
    pub frames_dir: PathBuf,
    /// Accepted frame file extensions, compared case-insensitively.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// A region is kept when its width or height reaches this many pixels.
    #[serde(default = "default_min_streak_length")]
    pub min_streak_length: u32,
    /// Process frame pairs on the rayon pool instead of one at a time.
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    /// Edge length of the square patch fed to the classifier.
    #[serde(default = "default_crop_size")]
    pub crop_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            frames_dir: default_frames_dir(),
            extensions: default_extensions(),
            min_streak_length: default_min_streak_length(),
            parallel: false,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            crop_size: default_crop_size(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the built-in defaults.
    ///
    /// Only used for the implicit default path; an explicitly requested file
    /// that does not exist is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(path = %path.display(), "no config file found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan.min_streak_length == 0 {
            return Err(ConfigError::Invalid(
                "scan.min_streak_length must be at least 1".into(),
            ));
        }
        if self.classifier.crop_size == 0 {
            return Err(ConfigError::Invalid(
                "classifier.crop_size must be at least 1".into(),
            ));
        }
        if self.scan.extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "scan.extensions must list at least one extension".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_frames_dir() -> PathBuf {
    "frames".into()
}
fn default_extensions() -> Vec<String> {
    vec!["jpg".into(), "jpeg".into(), "png".into()]
}
fn default_min_streak_length() -> u32 {
    30
}
fn default_model_path() -> PathBuf {
    "anomaly_detector.json".into()
}
fn default_crop_size() -> u32 {
    64
}
fn default_output_path() -> PathBuf {
    "anomalies.csv".into()
}
fn default_log_level() -> String {
    "info".into()
}
