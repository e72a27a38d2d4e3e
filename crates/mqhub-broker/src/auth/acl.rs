//! Role-based topic authorization.
//!
//! Patterns use MQTT wildcards (`+`, `#`) and may reference the
//! requesting client as `%c` (client id) or `%u` (username).

use ahash::AHashMap;

use super::{Authorizer, ClientInfo};
use crate::config::{AclConfig, DefaultPermissions};

/// Publish and subscribe patterns granted to one class of client.
#[derive(Debug, Clone, Default)]
struct Grants {
    write: Vec<String>,
    read: Vec<String>,
}

impl From<&DefaultPermissions> for Grants {
    fn from(perms: &DefaultPermissions) -> Self {
        Self {
            write: perms.publish.clone(),
            read: perms.subscribe.clone(),
        }
    }
}

/// Authorizer backed by the `[acl]` section.
///
/// Anonymous clients get the `anonymous` grants, authenticated clients with
/// a known role get that role's grants, and everyone else the `default` ones.
pub struct AclAuthorizer {
    roles: AHashMap<String, Grants>,
    default: Grants,
    anonymous: Grants,
}

impl AclAuthorizer {
    pub fn new(config: &AclConfig) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|role| {
                (
                    role.name.clone(),
                    Grants {
                        write: role.publish.clone(),
                        read: role.subscribe.clone(),
                    },
                )
            })
            .collect();

        Self {
            roles,
            default: Grants::from(&config.default),
            anonymous: Grants::from(&config.anonymous),
        }
    }

    fn grants_for(&self, client: &ClientInfo) -> &Grants {
        if client.is_anonymous {
            return &self.anonymous;
        }
        client
            .role
            .as_deref()
            .and_then(|role| self.roles.get(role))
            .unwrap_or(&self.default)
    }

    fn permits(patterns: &[String], client: &ClientInfo, topic: &str) -> bool {
        patterns.iter().any(|pattern| {
            expand_pattern(pattern, &client.client_id, client.username.as_deref())
                .is_some_and(|expanded| pattern_covers(&expanded, topic))
        })
    }
}

impl Authorizer for AclAuthorizer {
    fn can_write(&self, client: &ClientInfo, topic: &str) -> bool {
        let allowed = Self::permits(&self.grants_for(client).write, client, topic);
        if !allowed {
            log::debug!("ACL denied publish to '{}' for {}", topic, client.client_id);
        }
        allowed
    }

    fn can_read(&self, client: &ClientInfo, filter: &str) -> bool {
        let allowed = Self::permits(&self.grants_for(client).read, client, filter);
        if !allowed {
            log::debug!("ACL denied subscribe to '{}' for {}", filter, client.client_id);
        }
        allowed
    }
}

/// Replace `%c` and `%u` in a pattern. A missing username expands to "".
///
/// Returns `None` when a substituted value contains `+`, `#` or `/`: such a
/// pattern grants nothing, otherwise the identity would widen it.
fn expand_pattern(pattern: &str, client_id: &str, username: Option<&str>) -> Option<String> {
    let username = username.unwrap_or("");
    let unsafe_value = |value: &str| value.contains(['+', '#', '/']);
    if (pattern.contains("%c") && unsafe_value(client_id))
        || (pattern.contains("%u") && unsafe_value(username))
    {
        return None;
    }
    Some(pattern.replace("%c", client_id).replace("%u", username))
}

/// Whether `pattern` covers `topic`.
///
/// `topic` is a concrete name for writes and a filter for reads; in the
/// latter case wildcard levels in the filter only match the same wildcard
/// (or a covering one) in the pattern.
fn pattern_covers(pattern: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for pattern_level in pattern.split('/') {
        if pattern_level == "#" {
            return true;
        }
        match topic_levels.next() {
            None => return false,
            Some("#") => return false,
            Some(level) if pattern_level == "+" || pattern_level == level => {}
            Some(_) => return false,
        }
    }
    topic_levels.next().is_none()
}
