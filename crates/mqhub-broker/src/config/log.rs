//! Logging configuration.

use serde::Deserialize;

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or env_logger filter spec: error, warn, info, debug, trace,
    /// or e.g. `mqhub_broker=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    /// Install the process-wide logger. `RUST_LOG` wins over the configured level.
    ///
    /// Returns false when a logger was already installed.
    pub fn init(&self) -> bool {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&self.level))
            .try_init()
            .is_ok()
    }
}
