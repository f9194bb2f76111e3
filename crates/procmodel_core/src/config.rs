//! Service configuration.
//!
//! # Responsibility
//! - Provide defaults for every setting.
//! - Load a JSON config file and apply `PMR_*` environment overrides on top.
//!
//! # Invariants
//! - An override is parsed as the type of the field it replaces; a value that
//!   does not parse is rejected instead of silently ignored.
//! - `validate()` runs after every load.

use crate::logging::default_log_level;
use crate::source::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "PMR_";

/// Ordered command log implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandLogBackend {
    #[default]
    Memory,
    Kafka,
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
    /// Rotating log files go here; `None` logs to stderr.
    pub log_dir: Option<String>,
    /// SQLite file path; `:memory:` keeps documents in process memory.
    pub database_path: String,
    pub command_log: CommandLogBackend,
    pub kafka_url: String,
    pub group_id: String,
    pub process_topic: String,
    pub memory_log_partitions: usize,
    /// Base URL of the permission authority; empty or `-` selects the
    /// in-process authority.
    pub permissions_url: String,
    pub permissions_admin_token: String,
    pub authority_timeout_secs: u64,
    pub consumer_retry_base_ms: u64,
    pub consumer_retry_window_secs: u64,
    /// `0` disables the cleanup loop.
    pub cleanup_interval_secs: u64,
    pub cleanup_grace_secs: u64,
    pub cleanup_page_size: u64,
    pub run_startup_migration: bool,
    pub debug: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level().to_string(),
            log_dir: None,
            database_path: "procmodel.sqlite3".to_string(),
            command_log: CommandLogBackend::Memory,
            kafka_url: "localhost:9092".to_string(),
            group_id: "process-model-repository".to_string(),
            process_topic: "processmodel".to_string(),
            memory_log_partitions: 4,
            permissions_url: "http://localhost:8080".to_string(),
            permissions_admin_token: String::new(),
            authority_timeout_secs: 10,
            consumer_retry_base_ms: 1000,
            consumer_retry_window_secs: 600,
            cleanup_interval_secs: 600,
            cleanup_grace_secs: 60,
            cleanup_page_size: 1000,
            run_startup_migration: false,
            debug: false,
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(serde_json::Error),
    InvalidOverride {
        variable: String,
        reason: String,
    },
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "unable to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "malformed config: {err}"),
            Self::InvalidOverride { variable, reason } => {
                write!(f, "invalid value in `{variable}`: {reason}")
            }
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

impl ServiceConfig {
    /// Loads `path` (or defaults), then applies process environment overrides.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = base.with_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Replaces every field whose `PMR_<FIELD>` variable is set by `lookup`.
    pub fn with_overrides(
        self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<Self> {
        let Value::Object(fields) = serde_json::to_value(&self)? else {
            return Err(ConfigError::Invalid("config is not an object".to_string()));
        };
        let mut overridden = Map::new();
        for (field, current) in fields {
            let variable = format!("{ENV_PREFIX}{}", field.to_ascii_uppercase());
            let value = match lookup(&variable) {
                Some(raw) => parse_override(&variable, &current, &raw)?,
                None => current,
            };
            overridden.insert(field, value);
        }
        serde_json::from_value(Value::Object(overridden)).map_err(|err| {
            ConfigError::InvalidOverride {
                variable: format!("{ENV_PREFIX}*"),
                reason: err.to_string(),
            }
        })
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.process_topic.trim().is_empty() {
            return Err(ConfigError::Invalid("process_topic cannot be empty".to_string()));
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::Invalid("group_id cannot be empty".to_string()));
        }
        if self.memory_log_partitions == 0 {
            return Err(ConfigError::Invalid(
                "memory_log_partitions must be positive".to_string(),
            ));
        }
        if self.consumer_retry_base_ms == 0 {
            return Err(ConfigError::Invalid(
                "consumer_retry_base_ms must be positive".to_string(),
            ));
        }
        if self.command_log == CommandLogBackend::Kafka && self.kafka_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "kafka_url is required for the kafka command log".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_unit: Duration::from_millis(self.consumer_retry_base_ms),
            window: Duration::from_secs(self.consumer_retry_window_secs),
        }
    }

    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_secs > 0).then(|| Duration::from_secs(self.cleanup_interval_secs))
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }

    pub fn authority_timeout(&self) -> Duration {
        Duration::from_secs(self.authority_timeout_secs)
    }

    /// Whether grants are kept in process instead of a remote authority.
    pub fn uses_local_authority(&self) -> bool {
        matches!(self.permissions_url.trim(), "" | "-")
    }
}

fn parse_override(variable: &str, current: &Value, raw: &str) -> ConfigResult<Value> {
    let invalid = |reason: String| ConfigError::InvalidOverride {
        variable: variable.to_string(),
        reason,
    };
    match current {
        Value::Bool(_) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Value::Bool(true)),
            "false" | "0" | "no" => Ok(Value::Bool(false)),
            other => Err(invalid(format!("expected a boolean, got `{other}`"))),
        },
        Value::Number(_) => raw
            .trim()
            .parse::<u64>()
            .map(Value::from)
            .map_err(|err| invalid(err.to_string())),
        Value::Null if raw.is_empty() => Ok(Value::Null),
        _ => Ok(Value::String(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ServiceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cleanup_interval(), Some(Duration::from_secs(600)));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn overrides_follow_field_types() {
        let config = ServiceConfig::default()
            .with_overrides(lookup(&[
                ("PMR_DEBUG", "true"),
                ("PMR_CLEANUP_INTERVAL_SECS", "0"),
                ("PMR_COMMAND_LOG", "kafka"),
                ("PMR_LOG_DIR", "/var/log/procmodel"),
            ]))
            .unwrap();
        assert!(config.debug);
        assert_eq!(config.cleanup_interval(), None);
        assert_eq!(config.command_log, CommandLogBackend::Kafka);
        assert_eq!(config.log_dir.as_deref(), Some("/var/log/procmodel"));
    }

    #[test]
    fn malformed_overrides_are_rejected() {
        let err = ServiceConfig::default()
            .with_overrides(lookup(&[("PMR_CLEANUP_GRACE_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { ref variable, .. } if variable == "PMR_CLEANUP_GRACE_SECS"));

        let err = ServiceConfig::default()
            .with_overrides(lookup(&[("PMR_COMMAND_LOG", "carrier-pigeon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, br#"{"process_topic":"models","debug":true}"#).unwrap();
        let config = ServiceConfig::from_file(&path).unwrap();
        assert_eq!(config.process_topic, "models");
        assert!(config.debug);
        assert_eq!(config.group_id, ServiceConfig::default().group_id);
    }
}
