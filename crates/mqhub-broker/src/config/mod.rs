//! Broker configuration.
//!
//! Supports configuration from:
//! - TOML file (default: `mqhub.toml`)
//! - Environment variables with `MQHUB__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `MQHUB__ADMISSION__ALLOW_ANONYMOUS=false`
//! - `MQHUB__SESSION__MAX_QUEUED_MESSAGES=5000`
//! - `MQHUB__MQTT__MAX_QOS=1`

mod acl;
mod admission;
mod auth;
mod log;
mod mqtt;
mod persistence;
mod session;

use std::path::Path;
use std::sync::OnceLock;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use acl::{AclConfig, DefaultPermissions, RoleConfig};
pub use admission::AdmissionConfig;
pub use auth::{AuthConfig, UserConfig};
pub use log::LogConfig;
pub use mqtt::{MqttConfig, DEFAULT_MAX_TOPIC_LENGTH, DEFAULT_MAX_TOPIC_LEVELS};
pub use persistence::{PersistenceConfig, DEFAULT_PERSISTENCE_PATH};
pub use session::{SessionConfig, DEFAULT_MAX_QUEUED_MESSAGES};

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is valid")
    })
}

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string()
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// CONNECT admission flags.
    pub admission: AdmissionConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// Access control list configuration.
    pub acl: AclConfig,
    /// MQTT feature configuration.
    pub mqtt: MqttConfig,
    /// Session configuration.
    pub session: SessionConfig,
    /// Persistence configuration.
    pub persistence: PersistenceConfig,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// Config parsing/loading error.
    Config(config::ConfigError),
    /// Invalid configuration value.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error: defaults plus environment apply.
    /// Environment overrides use the `MQHUB__` prefix with double underscores
    /// for nesting, e.g. `MQHUB__ADMISSION__ALLOW_ANONYMOUS=false`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("admission.allow_anonymous", true)?
            .set_default("admission.allow_zero_byte_client_id", true)?
            .set_default("admission.reauthorize_subscriptions_on_connect", false)?
            .set_default("auth.enabled", false)?
            .set_default("acl.enabled", false)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.max_topic_length", DEFAULT_MAX_TOPIC_LENGTH as i64)?
            .set_default("mqtt.max_topic_levels", DEFAULT_MAX_TOPIC_LEVELS as i64)?
            .set_default(
                "session.max_queued_messages",
                DEFAULT_MAX_QUEUED_MESSAGES as i64,
            )?
            .set_default("persistence.enabled", false)?
            .set_default("persistence.path", DEFAULT_PERSISTENCE_PATH)?;

        let path = path.as_ref();
        if path.is_file() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQHUB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate().map_err(ConfigError::Validation)?;
        self.session.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }
}
