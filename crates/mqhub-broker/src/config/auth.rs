//! Authentication configuration.

use serde::Deserialize;

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable the static user list. When disabled every credential is accepted.
    pub enabled: bool,
    /// Client identifiers allowed to authenticate. Empty = any identifier.
    #[serde(default)]
    pub client_ids: Vec<String>,
    /// Static user list.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// User configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Username.
    pub username: String,
    /// Plaintext password (use password_hash for production).
    #[serde(default)]
    pub password: Option<String>,
    /// Argon2 password hash.
    #[serde(default)]
    pub password_hash: Option<String>,
    /// ACL role reference.
    #[serde(default)]
    pub role: Option<String>,
}
