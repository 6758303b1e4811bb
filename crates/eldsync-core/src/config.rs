//! Application configuration management.
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. An optional TOML file (see [`default_config_path`])
//! 3. `ELDSYNC__*` environment variables, `__` separating nested keys
//!    (e.g. `ELDSYNC__HISTORY__MAX_RETRIES=5`)
//!
//! The result is validated before it is handed to the rest of the crate.

use std::path::{Path, PathBuf};

use chrono::TimeDelta;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "ELDSYNC";

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("MAC address regex is valid")
});

static IMEI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{15}$").expect("IMEI regex is valid"));

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested configuration file does not exist.
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The layered sources could not be merged or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The configuration could not be serialized to TOML.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configuration file could not be written.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// Target path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A single field failed validation.
    #[error("{field}: {message}")]
    Validation {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which ELD to talk to and how to authenticate.
    pub device: DeviceConfig,
    /// Connection lifecycle timeouts.
    pub connection: ConnectionConfig,
    /// Chunked history fetch tuning.
    pub history: HistoryConfig,
    /// Startup escalation probe.
    pub escalation: EscalationConfig,
    /// Merged timeline limits.
    pub timeline: TimelineConfig,
    /// Local HTTP surface.
    pub server: ServerConfig,
}

/// ELD device selection and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// MAC address of the preferred ELD.
    pub address: Option<String>,
    /// Device IMEI used during authentication.
    pub imei: Option<String>,
    /// Device passcode used during authentication.
    #[serde(skip_serializing)]
    pub passcode: Option<String>,
    /// Only devices whose advertised name starts with one of these prefixes are
    /// reported by scans. Empty means no filtering.
    pub name_prefixes: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            imei: None,
            passcode: None,
            name_prefixes: vec!["KD032".to_string(), "PT30".to_string()],
        }
    }
}

/// Connection step budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long a scan runs before it is stopped automatically.
    pub scan_timeout_secs: u64,
    /// Budget for the link to come up after `connect`.
    pub connect_timeout_secs: u64,
    /// Budget for the device to report successful authentication.
    pub auth_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 10,
            connect_timeout_secs: 20,
            auth_timeout_secs: 15,
        }
    }
}

/// History fetch tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Default chunk width for ad-hoc history fetches.
    pub chunk_size_minutes: u32,
    /// Attempts per chunk before it is marked failed. Must be at least 1.
    pub max_retries: u32,
    /// First backoff delay.
    pub base_backoff_ms: u64,
    /// Backoff ceiling.
    pub max_backoff_ms: u64,
    /// How long to keep collecting streamed records after a chunk query is
    /// acknowledged.
    pub settle_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            chunk_size_minutes: 60,
            max_retries: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 4000,
            settle_ms: 1500,
        }
    }
}

/// One escalation probe window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Label reported in progress updates.
    pub name: String,
    /// How far back from "now" this probe reaches.
    pub window_minutes: u32,
    /// Chunk width used for this probe.
    pub chunk_minutes: u32,
}

impl StageConfig {
    fn new(name: &str, window_minutes: u32, chunk_minutes: u32) -> Self {
        Self {
            name: name.to_string(),
            window_minutes,
            chunk_minutes,
        }
    }
}

/// Escalation probe configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Probe windows, narrowest first.
    pub stages: Vec<StageConfig>,
    /// A record only counts as valid data when it is at most this old.
    pub valid_data_max_age_days: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            stages: vec![
                StageConfig::new("5min", 5, 5),
                StageConfig::new("20min", 20, 10),
                StageConfig::new("4h", 240, 60),
                StageConfig::new("24h", 1440, 60),
            ],
            valid_data_max_age_days: 7,
        }
    }
}

/// Merged timeline limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Drop records older than this many hours on each merge. 0 keeps the
    /// whole session.
    pub retention_hours: u32,
}

impl TimelineConfig {
    /// Retention window, if one is configured.
    #[must_use]
    pub fn retention(&self) -> Option<TimeDelta> {
        (self.retention_hours > 0).then(|| TimeDelta::hours(i64::from(self.retention_hours)))
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen_addr: String,
    /// Production logging (JSON files) instead of pretty stdout.
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            production: false,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the
    /// environment, then validate it.
    ///
    /// A missing file at `path` is an error; pass `None` to fall back to
    /// [`default_config_path`], which may be absent.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.to_path_buf()));
                }
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    builder = builder.add_source(config::File::from(default_path).required(false));
                }
            }
        }

        let loaded: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        tracing::debug!(?path, "configuration loaded");
        Ok(loaded)
    }

    /// Save configuration to `path` as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns every violated constraint; a single violation is returned
    /// unwrapped.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut fail = |field: &'static str, message: String| {
            errors.push(ConfigError::Validation { field, message });
        };

        if let Some(address) = &self.device.address {
            if !is_valid_mac_address(address) {
                fail("device.address", format!("'{address}' is not a MAC address"));
            }
        }
        if let Some(imei) = &self.device.imei {
            if !is_valid_imei(imei) {
                fail("device.imei", "must be exactly 15 digits".to_string());
            }
        }

        if self.connection.connect_timeout_secs == 0 {
            fail("connection.connect_timeout_secs", "must be positive".to_string());
        }
        if self.connection.auth_timeout_secs == 0 {
            fail("connection.auth_timeout_secs", "must be positive".to_string());
        }

        if self.history.chunk_size_minutes == 0 {
            fail("history.chunk_size_minutes", "must be positive".to_string());
        }
        if self.history.max_retries == 0 {
            fail("history.max_retries", "must allow at least one attempt".to_string());
        }
        if self.history.base_backoff_ms > self.history.max_backoff_ms {
            fail(
                "history.base_backoff_ms",
                "must not exceed history.max_backoff_ms".to_string(),
            );
        }

        if self.escalation.stages.is_empty() {
            fail("escalation.stages", "at least one stage is required".to_string());
        }
        let mut previous_window = 0;
        for stage in &self.escalation.stages {
            if stage.chunk_minutes == 0 {
                fail(
                    "escalation.stages",
                    format!("stage '{}' has a zero chunk size", stage.name),
                );
            }
            if stage.window_minutes <= previous_window {
                fail(
                    "escalation.stages",
                    format!("stage '{}' does not widen the previous window", stage.name),
                );
            }
            previous_window = stage.window_minutes;
        }
        if self.escalation.valid_data_max_age_days == 0 {
            fail("escalation.valid_data_max_age_days", "must be positive".to_string());
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Validate a colon-separated Bluetooth MAC address.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

/// Validate a 15-digit device IMEI.
#[must_use]
pub fn is_valid_imei(imei: &str) -> bool {
    IMEI_RE.is_match(imei)
}

/// Platform configuration file location.
///
/// On Linux: `/etc/eldsync/config.toml`.
/// Elsewhere: the platform config dir, e.g. `~/Library/Application Support/eldsync/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Some(PathBuf::from("/etc/eldsync/config.toml"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "eldsync")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_default_stages_widen() {
        let stages = Config::default().escalation.stages;
        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["5min", "20min", "4h", "24h"]);
        assert_eq!(stages[3].window_minutes, 24 * 60);
    }

    #[test]
    fn test_mac_address_validation() {
        assert!(is_valid_mac_address("C4:A8:28:43:14:9A"));
        assert!(is_valid_mac_address("c4:a8:28:43:14:9a"));
        assert!(!is_valid_mac_address("C4-A8-28-43-14-9A"));
        assert!(!is_valid_mac_address("C4:A8:28:43:14"));
    }

    #[test]
    fn test_imei_validation() {
        assert!(is_valid_imei("356938035643809"));
        assert!(!is_valid_imei("35693803564380"));
        assert!(!is_valid_imei("35693803564380a"));
    }

    #[test]
    fn test_validation_collects_multiple_errors() {
        let mut config = Config::default();
        config.history.max_retries = 0;
        config.history.chunk_size_minutes = 0;

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_rejects_zero_max_retries() {
        let mut config = Config::default();
        config.history.max_retries = 0;

        match config.validate() {
            Err(ConfigError::Validation { field, .. }) => assert_eq!(field, "history.max_retries"),
            other => panic!("expected a max_retries error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_rejects_zero_max_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[history]\nmax_retries = 0\n").unwrap();

        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::Validation { field: "history.max_retries", .. })
        ));
    }

    #[test]
    fn test_timeline_retention() {
        assert_eq!(TimelineConfig::default().retention(), None);
        let config = TimelineConfig { retention_hours: 48 };
        assert_eq!(config.retention(), Some(TimeDelta::hours(48)));
    }

    #[test]
    fn test_validation_rejects_non_widening_stages() {
        let mut config = Config::default();
        config.escalation.stages[1].window_minutes = 5;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("20min"));
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[device]
address = "C4:A8:28:43:14:9A"

[history]
max_retries = 5
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.device.address.as_deref(), Some("C4:A8:28:43:14:9A"));
        assert_eq!(config.history.max_retries, 5);
        assert_eq!(config.history.chunk_size_minutes, 60);
        assert_eq!(config.escalation.stages.len(), 4);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[device]\naddress = \"not-a-mac\"\n").unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { field: "device.address", .. }));
    }

    #[test]
    fn test_save_round_trips_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.connection.auth_timeout_secs = 30;
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.connection.auth_timeout_secs, 30);
    }
}
