//! Session configuration.

use serde::Deserialize;

/// Default number of messages queued for an offline persistent session.
pub const DEFAULT_MAX_QUEUED_MESSAGES: usize = 1000;

/// Session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Messages kept for a disconnected persistent session. When the queue is
    /// full the oldest message is dropped.
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
}

fn default_max_queued_messages() -> usize {
    DEFAULT_MAX_QUEUED_MESSAGES
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_queued_messages: DEFAULT_MAX_QUEUED_MESSAGES,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_queued_messages == 0 {
            return Err("max_queued_messages must be greater than 0".into());
        }
        Ok(())
    }
}
