//! Static user authentication from configuration.
//!
//! Supports plaintext passwords (for development) and argon2 hashes (for production),
//! optionally restricted to a list of known client identifiers.

use ahash::{AHashMap, AHashSet};
use argon2::{Argon2, PasswordHash, PasswordVerifier};

use super::{AuthContext, AuthResult, Authenticator};
use crate::config::AuthConfig;

/// A user entry with pre-processed credentials.
struct User {
    /// Plaintext password (if configured). Use only for development.
    password: Option<String>,
    /// Argon2 password hash in PHC string format.
    password_hash: Option<String>,
    /// Role for ACL lookups.
    role: Option<String>,
}

/// Static authenticator that validates against a configured user list.
pub struct StaticAuthenticator {
    /// Map of username -> user credentials.
    users: AHashMap<String, User>,
    /// Client identifiers allowed to connect. Empty = any.
    client_ids: AHashSet<String>,
}

impl StaticAuthenticator {
    /// Create a new static authenticator from config.
    pub fn new(config: &AuthConfig) -> Self {
        let mut users = AHashMap::with_capacity(config.users.len());

        for user_config in &config.users {
            users.insert(
                user_config.username.clone(),
                User {
                    password: user_config.password.clone(),
                    password_hash: user_config.password_hash.clone(),
                    role: user_config.role.clone(),
                },
            );
        }

        Self {
            users,
            client_ids: config.client_ids.iter().cloned().collect(),
        }
    }

    /// Verify a password against stored credentials.
    fn verify_password(&self, user: &User, password: &[u8]) -> bool {
        if let Some(ref hash_str) = user.password_hash {
            return self.verify_argon2(hash_str, password);
        }

        if let Some(ref stored) = user.password {
            return password == stored.as_bytes();
        }

        false
    }

    /// Verify password against argon2 hash in PHC string format.
    fn verify_argon2(&self, hash_str: &str, password: &[u8]) -> bool {
        let Ok(parsed_hash) = PasswordHash::new(hash_str) else {
            log::warn!("Invalid argon2 hash format in config");
            return false;
        };

        Argon2::default()
            .verify_password(password, &parsed_hash)
            .is_ok()
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, ctx: &AuthContext) -> (AuthResult, Option<String>) {
        if !self.client_ids.is_empty() && !self.client_ids.contains(ctx.client_id) {
            return (AuthResult::DenyBadCredentials, None);
        }

        let (Some(username), Some(password)) = (ctx.username, ctx.password) else {
            return (AuthResult::DenyBadCredentials, None);
        };

        let Some(user) = self.users.get(username) else {
            return (AuthResult::DenyBadCredentials, None);
        };

        if self.verify_password(user, password) {
            (AuthResult::Allow, user.role.clone())
        } else {
            (AuthResult::DenyBadCredentials, None)
        }
    }
}
