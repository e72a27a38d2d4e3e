//! CONNECT admission configuration.

use serde::Deserialize;

/// Flags consulted by the connection gateway while admitting a CONNECT.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Accept CONNECT packets carrying neither username nor password.
    pub allow_anonymous: bool,
    /// Accept an empty client identifier (clean sessions only); the broker
    /// generates one.
    pub allow_zero_byte_client_id: bool,
    /// Re-check a resumed session's subscriptions with the authorizer and drop
    /// the ones that are no longer permitted.
    pub reauthorize_subscriptions_on_connect: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            allow_zero_byte_client_id: true,
            reauthorize_subscriptions_on_connect: false,
        }
    }
}

impl AdmissionConfig {
    pub fn new(
        allow_anonymous: bool,
        allow_zero_byte_client_id: bool,
        reauthorize_subscriptions_on_connect: bool,
    ) -> Self {
        Self {
            allow_anonymous,
            allow_zero_byte_client_id,
            reauthorize_subscriptions_on_connect,
        }
    }
}
