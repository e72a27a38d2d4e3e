//! Error types for the broker core.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::persistence::PersistenceError;

/// Failures surfaced by the shared broker components.
///
/// Authentication and authorization verdicts are not errors; they are
/// reported through CONNACK / SUBACK codes by the gateway.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Storage error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
