//! Authentication and authorization collaborators.
//!
//! The broker core never decides whether credentials are valid or whether a
//! topic may be used; it only decides *when* these collaborators are asked:
//! - Authentication: once per CONNECT, before any shared state is touched
//! - Authorization: on every SUBSCRIBE filter and PUBLISH topic

mod acl;
mod static_auth;

use std::sync::Arc;

pub use acl::AclAuthorizer;
pub use static_auth::StaticAuthenticator;

use crate::config::{AclConfig, AuthConfig};

/// Result of an authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// Access granted.
    Allow,
    /// Access denied - bad credentials.
    DenyBadCredentials,
    /// Access denied - not authorized.
    DenyNotAuthorized,
    /// Access denied - the credential store could not be consulted.
    DenyServerError,
}

impl AuthResult {
    /// Returns true if access is allowed.
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthResult::Allow)
    }
}

/// Context for authentication (CONNECT packet).
#[derive(Debug)]
pub struct AuthContext<'a> {
    /// Client ID from CONNECT packet (possibly generated by the broker).
    pub client_id: &'a str,
    /// Username (optional).
    pub username: Option<&'a str>,
    /// Password (optional).
    pub password: Option<&'a [u8]>,
}

/// Information about an admitted client, consulted by authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client ID.
    pub client_id: String,
    /// Username (if authenticated with one).
    pub username: Option<String>,
    /// Role assigned during authentication.
    pub role: Option<String>,
    /// Whether this is an anonymous (unauthenticated) connection.
    pub is_anonymous: bool,
}

impl ClientInfo {
    /// Create a new ClientInfo for an anonymous client.
    pub fn anonymous(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            username: None,
            role: None,
            is_anonymous: true,
        }
    }

    /// Create a new ClientInfo for an authenticated client.
    pub fn authenticated(
        client_id: impl Into<String>,
        username: Option<String>,
        role: Option<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            username,
            role,
            is_anonymous: false,
        }
    }
}

/// Authentication trait - validates credentials on CONNECT.
///
/// Implementations must be thread-safe: every connection actor calls it from
/// its own thread. A call may block; only the calling connection waits.
/// Rejection must have no side effects.
pub trait Authenticator: Send + Sync + 'static {
    /// Authenticate a client connection.
    ///
    /// Returns `AuthResult::Allow` and an optional role on success.
    /// The role is used for ACL lookups.
    fn authenticate(&self, ctx: &AuthContext) -> (AuthResult, Option<String>);
}

/// Authorization policy - checks publish/subscribe permissions.
///
/// Consulted on the hot path, so implementations should be fast.
pub trait Authorizer: Send + Sync + 'static {
    /// Whether the client may publish to `topic`.
    fn can_write(&self, client: &ClientInfo, topic: &str) -> bool;

    /// Whether the client may subscribe to `filter`.
    fn can_read(&self, client: &ClientInfo, filter: &str) -> bool;
}

/// Authenticator that accepts any credentials.
#[derive(Debug, Clone, Default)]
pub struct AllowAllAuth;

impl Authenticator for AllowAllAuth {
    #[inline]
    fn authenticate(&self, _ctx: &AuthContext) -> (AuthResult, Option<String>) {
        (AuthResult::Allow, None)
    }
}

/// Authorizer that permits every operation.
#[derive(Debug, Clone, Default)]
pub struct AllowAllAcl;

impl Authorizer for AllowAllAcl {
    #[inline]
    fn can_write(&self, _client: &ClientInfo, _topic: &str) -> bool {
        true
    }

    #[inline]
    fn can_read(&self, _client: &ClientInfo, _filter: &str) -> bool {
        true
    }
}

/// Build the authenticator described by the `[auth]` section.
pub fn authenticator_from_config(config: &AuthConfig) -> Arc<dyn Authenticator> {
    if config.enabled {
        Arc::new(StaticAuthenticator::new(config))
    } else {
        Arc::new(AllowAllAuth)
    }
}

/// Build the authorizer described by the `[acl]` section.
pub fn authorizer_from_config(config: &AclConfig) -> Arc<dyn Authorizer> {
    if config.enabled {
        Arc::new(AclAuthorizer::new(config))
    } else {
        Arc::new(AllowAllAcl)
    }
}
