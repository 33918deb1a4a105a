//! Layered configuration loading for the smart-assistant services.
//!
//! Every module (and the `sactl` tool) reads the same three sections:
//!
//! - `[mqtt]`: broker address, default QoS, keepalive, and reconnect backoff.
//! - `[logging]`: log level, output format, and the rotated log directory.
//! - `[system]`: topic namespace prefix, project root, heartbeat interval.
//!
//! # Usage
//!
//! ```rust,no_run
//! use saconf::SaConfig;
//!
//! let config = SaConfig::load().expect("Failed to load config");
//! println!("broker: {}:{}", config.mqtt.broker, config.mqtt.port);
//! println!("prefix: {}", config.system.service_prefix);
//! ```
//!
//! # Config File Locations
//!
//! `mqtt.broker` has no default and must come from one of these layers.
//! Files are loaded in order (later wins, per key):
//! 1. `/etc/smart-assistant/config.toml` (system)
//! 2. `~/.config/smart-assistant/config.toml` (user)
//! 3. `./smart-assistant.toml` or the path given with `--config`
//! 4. Environment variables (`SA_<SECTION>_<FIELD>`, e.g. `SA_MQTT_BROKER`)
//!
//! # Example Config
//!
//! ```toml
//! [mqtt]
//! broker = "localhost"
//! port = 1883
//! qos = 1
//! keepalive = 60
//!
//! [logging]
//! level = "info"
//! dir = "logs"
//! rotate_days = 7
//!
//! [system]
//! service_prefix = "sa"
//! heartbeat_interval_secs = 30
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, ConfigSources, DEFAULT_ENV_PREFIX};
pub use sections::{LoggingConfig, MqttConfig, SystemConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration failed validation: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Complete smart-assistant configuration.
///
/// `Default` leaves `mqtt.broker` empty, so a default config does not pass
/// [`SaConfig::validate`] until a broker is filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SaConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub system: SystemConfig,
}

impl SaConfig {
    /// Load configuration from all sources.
    ///
    /// Fails when no layer names `mqtt.broker`.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/smart-assistant/config.toml`
    /// 3. `~/.config/smart-assistant/config.toml`
    /// 4. `./smart-assistant.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an optional explicit file replacing the
    /// local `./smart-assistant.toml` override.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        Self::load_layers(&files, DEFAULT_ENV_PREFIX, std::env::vars())
    }

    /// Merge the given files in order, overlay environment variables carrying
    /// `env_prefix`, then deserialize and validate.
    pub fn load_layers<I>(
        files: &[PathBuf],
        env_prefix: &str,
        vars: I,
    ) -> Result<(Self, ConfigSources), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut sources = ConfigSources::default();
        let mut table = toml::Table::new();

        for path in files {
            let file_table = loader::load_from_file(path)?;
            loader::merge_tables(&mut table, file_table);
            sources.files.push(path.clone());
        }

        sources.env_overrides = loader::apply_env_overrides(&mut table, env_prefix, vars);

        let config: SaConfig = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Invalid {
                message: e.message().to_string(),
            })?;
        config.validate()?;

        Ok((config, sources))
    }

    /// Check cross-field constraints, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let mqtt = &self.mqtt;
        if mqtt.broker.trim().is_empty() {
            problems.push(
                "mqtt.broker is required (set it under [mqtt] or with SA_MQTT_BROKER)".to_string(),
            );
        }
        if mqtt.port == 0 {
            problems.push("mqtt.port must be non-zero".to_string());
        }
        if mqtt.qos > 2 {
            problems.push(format!("mqtt.qos must be 0, 1 or 2 (got {})", mqtt.qos));
        }
        if mqtt.keepalive == 0 {
            problems.push("mqtt.keepalive must be at least 1 second".to_string());
        }
        if mqtt.reconnect_initial_ms == 0 {
            problems.push("mqtt.reconnect_initial_ms must be non-zero".to_string());
        }
        if mqtt.reconnect_max_ms < mqtt.reconnect_initial_ms {
            problems.push(format!(
                "mqtt.reconnect_max_ms ({}) must not be below reconnect_initial_ms ({})",
                mqtt.reconnect_max_ms, mqtt.reconnect_initial_ms
            ));
        }

        let level = self.logging.level.to_ascii_lowercase();
        if !LoggingConfig::LEVELS.contains(&level.as_str()) {
            problems.push(format!(
                "logging.level '{}' is not one of {}",
                self.logging.level,
                LoggingConfig::LEVELS.join(", ")
            ));
        }
        if self.logging.dir.as_os_str().is_empty() {
            problems.push("logging.dir must not be empty".to_string());
        }
        if self.logging.rotate_days == 0 {
            problems.push("logging.rotate_days must be at least 1".to_string());
        }

        let prefix = &self.system.service_prefix;
        if prefix.is_empty() {
            problems.push("system.service_prefix must not be empty".to_string());
        } else if prefix.contains(['/', '+', '#']) {
            problems.push(format!(
                "system.service_prefix '{}' must be a single topic segment without wildcards",
                prefix
            ));
        }
        if self.system.heartbeat_interval_secs == 0 {
            problems.push("system.heartbeat_interval_secs must be non-zero".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems))
        }
    }

    /// Serialize config to a TOML document that loads back to the same
    /// values.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let body = toml::to_string_pretty(self)?;
        Ok(format!("# Smart Assistant Configuration\n\n{}", body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn no_env() -> Vec<(String, String)> {
        Vec::new()
    }

    fn with_broker() -> SaConfig {
        let mut config = SaConfig::default();
        config.mqtt.broker = "localhost".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = SaConfig::default();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.system.service_prefix, "sa");
        assert!(with_broker().validate().is_ok());
    }

    #[test]
    fn test_default_config_needs_a_broker() {
        match SaConfig::default().validate().unwrap_err() {
            ConfigError::Validation(problems) => {
                assert_eq!(problems.len(), 1, "problems: {problems:?}");
                assert!(problems[0].contains("mqtt.broker is required"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_to_toml() {
        let toml = with_broker().to_toml().unwrap();
        assert!(toml.starts_with("# Smart Assistant Configuration"));
        assert!(toml.contains("[mqtt]"));
        assert!(toml.contains("[logging]"));
        assert!(toml.contains("[system]"));
    }

    #[test]
    fn test_to_toml_reparses_to_same_config() {
        let mut config = with_broker();
        config.mqtt.broker = "mqtt.lan".to_string();
        config.logging.json = true;
        config.logging.rotate_days = 14;

        let parsed: SaConfig = toml::from_str(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_to_toml_escapes_quotes_and_backslashes() {
        let mut config = with_broker();
        config.mqtt.broker = "broker \"lab\"".to_string();
        config.system.project_root = PathBuf::from(r"C:\assistant\root");
        config.logging.dir = PathBuf::from("logs \"today\"");

        let parsed: SaConfig = toml::from_str(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_no_files_and_no_broker_fails() {
        let err = SaConfig::load_layers(&[], "SA", no_env()).unwrap_err();
        match err {
            ConfigError::Validation(problems) => {
                assert!(problems.iter().any(|p| p.contains("mqtt.broker")), "{problems:?}");
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_file_without_broker_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_config(&dir, "c.toml", "[mqtt]\nport = 1884\n");

        let err = SaConfig::load_layers(&[file], "SA", no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)), "got {err:?}");
    }

    #[test]
    fn test_broker_from_env_alone_loads_defaults() {
        let vars = vec![("SA_MQTT_BROKER".to_string(), "mqtt.lan".to_string())];
        let (config, sources) = SaConfig::load_layers(&[], "SA", vars).unwrap();

        let mut expected = SaConfig::default();
        expected.mqtt.broker = "mqtt.lan".to_string();
        assert_eq!(config, expected);
        assert!(sources.files.is_empty());
        assert_eq!(sources.env_overrides, vec!["SA_MQTT_BROKER".to_string()]);
    }

    #[test]
    fn test_later_file_wins_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let system = write_config(
            &dir,
            "system.toml",
            "[mqtt]\nbroker = \"broker.local\"\nport = 1884\n",
        );
        let local = write_config(&dir, "local.toml", "[mqtt]\nport = 1999\n");

        let (config, sources) =
            SaConfig::load_layers(&[system.clone(), local.clone()], "SA", no_env()).unwrap();

        assert_eq!(config.mqtt.broker, "broker.local");
        assert_eq!(config.mqtt.port, 1999);
        assert_eq!(sources.files, vec![system, local]);
    }

    #[test]
    fn test_env_overrides_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_config(
            &dir,
            "c.toml",
            "[mqtt]\nbroker = \"mqtt.lan\"\n\n[system]\nservice_prefix = \"home\"\n",
        );
        let vars = vec![
            ("SA_SYSTEM_SERVICE_PREFIX".to_string(), "lab".to_string()),
            ("SA_MQTT_PORT".to_string(), "8883".to_string()),
        ];

        let (config, sources) = SaConfig::load_layers(&[file], "SA", vars).unwrap();

        assert_eq!(config.system.service_prefix, "lab");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(
            sources.env_overrides,
            vec!["SA_MQTT_PORT".to_string(), "SA_SYSTEM_SERVICE_PREFIX".to_string()]
        );
    }

    #[test]
    fn test_missing_cli_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");

        let err = SaConfig::load_layers(&[missing.clone()], "SA", no_env()).unwrap_err();
        match err {
            ConfigError::FileRead { path, .. } => assert_eq!(path, missing),
            other => panic!("expected FileRead, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_type_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_config(&dir, "c.toml", "[mqtt]\nport = \"not a number\"\n");

        let err = SaConfig::load_layers(&[file], "SA", no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "got {err:?}");
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let mut config = with_broker();
        config.mqtt.qos = 3;
        config.mqtt.port = 0;
        config.logging.level = "loud".to_string();
        config.system.service_prefix = "sa/x".to_string();

        match config.validate().unwrap_err() {
            ConfigError::Validation(problems) => {
                assert_eq!(problems.len(), 4, "problems: {problems:?}");
                assert!(problems.iter().any(|p| p.contains("mqtt.qos")));
                assert!(problems.iter().any(|p| p.contains("logging.level")));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_reconnect_window_must_be_ordered() {
        let mut config = with_broker();
        config.mqtt.reconnect_initial_ms = 5_000;
        config.mqtt.reconnect_max_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_level_is_case_insensitive() {
        let mut config = with_broker();
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_rotation_needs_a_day() {
        let mut config = with_broker();
        config.logging.rotate_days = 0;
        match config.validate().unwrap_err() {
            ConfigError::Validation(problems) => {
                assert_eq!(problems, vec!["logging.rotate_days must be at least 1".to_string()]);
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }
}
