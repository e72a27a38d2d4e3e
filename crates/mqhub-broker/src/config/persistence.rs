//! Persistence configuration.
//!
//! Controls disk storage of retained messages and persistent sessions.

use std::path::PathBuf;

use serde::Deserialize;

/// Default persistence data directory.
pub const DEFAULT_PERSISTENCE_PATH: &str = "./data";

/// Persistence configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Store retained messages and persistent sessions on disk.
    ///
    /// Requires the `persistence` feature; otherwise in-memory repositories
    /// are used and nothing survives a restart.
    pub enabled: bool,

    /// Directory path for persistence data files.
    ///
    /// Default: `./data`
    pub path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from(DEFAULT_PERSISTENCE_PATH),
        }
    }
}
