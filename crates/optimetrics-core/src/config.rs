//! TOML configuration.
//!
//! Every section is optional and falls back to its defaults, so an empty file
//! is a valid configuration. Values are resolved once at startup; components
//! receive plain fields, never the file.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::util::parse_size;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read config {}: {}", path.display(), source)
            }
            ConfigError::Parse(e) => write!(f, "invalid config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub hardware_id: HardwareIdConfig,
    pub cloud: CloudConfig,
    pub classification: ClassificationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub interval_secs: u64,
    pub collect_cpu: bool,
    pub collect_gpu: bool,
    pub collect_memory: bool,
    pub collect_disk: bool,
    pub collect_network: bool,
    pub collect_power: bool,
    /// Relative change, in percent, that makes a snapshot worth keeping.
    pub delta_threshold_percent: f64,
    /// Retained snapshots per flush.
    pub batch_size: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            collect_cpu: true,
            collect_gpu: true,
            collect_memory: true,
            collect_disk: true,
            collect_network: true,
            collect_power: true,
            delta_threshold_percent: 2.0,
            batch_size: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when neither `RUST_LOG` nor a CLI verbosity flag is given.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Which sinks receive flushed batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Categorized,
    Rolling,
    Both,
}

impl StorageMode {
    pub fn categorized(&self) -> bool {
        matches!(self, StorageMode::Categorized | StorageMode::Both)
    }

    pub fn rolling(&self) -> bool {
        matches!(self, StorageMode::Rolling | StorageMode::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub mode: StorageMode,
    /// Rolling file size limit in bytes. Accepts "50M" style strings.
    #[serde(deserialize_with = "deserialize_size")]
    pub max_file_size: u64,
    pub compress_after_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("logs"),
            mode: StorageMode::default(),
            max_file_size: 50 * 1024 * 1024,
            compress_after_days: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareIdConfig {
    pub include_cpu: bool,
    pub include_gpu: bool,
    pub include_motherboard: bool,
    pub hash_algorithm: HashAlgorithm,
}

impl Default for HardwareIdConfig {
    fn default() -> Self {
        Self {
            include_cpu: true,
            include_gpu: true,
            include_motherboard: false,
            hash_algorithm: HashAlgorithm::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub enabled: bool,
    pub sync_interval_minutes: u64,
    pub initial_delay_secs: u64,
    /// Service account key (JSON).
    pub credentials_path: Option<PathBuf>,
    /// File holding a ready OAuth access token. Used when no key is set.
    pub token_path: Option<PathBuf>,
    /// Folder under which one folder per device is created.
    pub shared_folder_id: Option<String>,
    pub api_base: String,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sync_interval_minutes: 5,
            initial_delay_secs: 30,
            credentials_path: None,
            token_path: None,
            shared_folder_id: None,
            api_base: "https://www.googleapis.com".to_string(),
            retry_attempts: 3,
            retry_delay_secs: 60,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub enabled: bool,
    pub window_size: usize,
    pub min_samples: usize,
    pub confidence_threshold: f64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: 60,
            min_samples: 5,
            confidence_threshold: 0.6,
        }
    }
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

impl Config {
    /// Loads the configuration. Without a path the defaults are used; an
    /// explicit path must exist and parse.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.general.interval_secs == 0 {
            return invalid("general.interval_secs must be at least 1");
        }
        if self.general.batch_size == 0 {
            return invalid("general.batch_size must be at least 1");
        }
        let threshold = self.general.delta_threshold_percent;
        if threshold.is_nan() || threshold < 0.0 {
            return invalid("general.delta_threshold_percent must be >= 0");
        }
        if self.storage.max_file_size == 0 {
            return invalid("storage.max_file_size must be > 0");
        }
        let c = &self.classification;
        if !(0.0..=1.0).contains(&c.confidence_threshold) {
            return invalid("classification.confidence_threshold must be within [0, 1]");
        }
        if c.min_samples == 0 || c.window_size < c.min_samples {
            return invalid("classification.window_size must be >= min_samples >= 1");
        }
        if self.cloud.enabled {
            if self.cloud.credentials_path.is_none() && self.cloud.token_path.is_none() {
                return invalid("cloud.enabled requires credentials_path or token_path");
            }
            if self.cloud.shared_folder_id.as_deref().is_none_or(str::is_empty) {
                return invalid("cloud.enabled requires shared_folder_id");
            }
            if self.cloud.sync_interval_minutes == 0 {
                return invalid("cloud.sync_interval_minutes must be at least 1");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.general.interval_secs, 1);
        assert_eq!(config.general.delta_threshold_percent, 2.0);
        assert_eq!(config.general.batch_size, 60);
        assert_eq!(config.storage.data_dir, PathBuf::from("logs"));
        assert_eq!(config.storage.mode, StorageMode::Categorized);
        assert_eq!(config.storage.max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.cloud.sync_interval_minutes, 5);
        assert_eq!(config.cloud.retry_attempts, 3);
        assert_eq!(config.classification.window_size, 60);
        assert!(!config.cloud.enabled);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = Config::from_toml_str(
            r#"
[general]
interval_secs = 5
collect_gpu = false

[storage]
mode = "both"
max_file_size = "10M"

[hardware_id]
hash_algorithm = "sha512"
"#,
        )
        .unwrap();
        assert_eq!(config.general.interval_secs, 5);
        assert!(!config.general.collect_gpu);
        assert!(config.general.collect_cpu);
        assert_eq!(config.storage.max_file_size, 10 * 1024 * 1024);
        assert!(config.storage.mode.categorized() && config.storage.mode.rolling());
        assert_eq!(config.hardware_id.hash_algorithm, HashAlgorithm::Sha512);
        assert_eq!(config.classification, ClassificationConfig::default());
    }

    #[test]
    fn test_numeric_size() {
        let config = Config::from_toml_str("[storage]\nmax_file_size = 4096\n").unwrap();
        assert_eq!(config.storage.max_file_size, 4096);
    }

    #[test]
    fn test_missing_explicit_path_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_malformed_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[general\ninterval_secs = ").unwrap();
        assert!(matches!(
            Config::load(Some(&path)).unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn test_cloud_requires_credentials_and_folder() {
        let err = Config::from_toml_str("[cloud]\nenabled = true\n").unwrap_err();
        assert!(err.to_string().contains("credentials_path"));

        let err = Config::from_toml_str("[cloud]\nenabled = true\ntoken_path = \"t\"\n").unwrap_err();
        assert!(err.to_string().contains("shared_folder_id"));

        let ok = Config::from_toml_str(
            "[cloud]\nenabled = true\ntoken_path = \"t\"\nshared_folder_id = \"root\"\n",
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_toml_str("[general]\ninterval_secs = 0\n").is_err());
        assert!(Config::from_toml_str("[general]\nbatch_size = 0\n").is_err());
        assert!(Config::from_toml_str("[classification]\nconfidence_threshold = 1.5\n").is_err());
        assert!(Config::from_toml_str("[classification]\nwindow_size = 3\n").is_err());
        assert!(Config::from_toml_str("[storage]\nmode = \"tape\"\n").is_err());
    }

    #[test]
    fn test_rendered_defaults_parse_back() {
        let text = Config::default().to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&text).unwrap(), Config::default());
    }
}
