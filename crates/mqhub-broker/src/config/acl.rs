//! ACL (Access Control List) configuration.

use serde::Deserialize;

/// ACL (Access Control List) configuration.
///
/// Patterns use MQTT wildcards (`+`, `#`) and may reference the client
/// identifier as `%c` and the username as `%u`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    /// Enable ACL. When disabled every read and write is permitted.
    pub enabled: bool,
    /// Role definitions.
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
    /// Permissions for authenticated clients without an explicit role.
    #[serde(default)]
    pub default: DefaultPermissions,
    /// Permissions for anonymous connections.
    #[serde(default)]
    pub anonymous: DefaultPermissions,
}

/// Role configuration with publish/subscribe patterns.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleConfig {
    /// Role name, referenced from `auth.users[].role`.
    pub name: String,
    /// Topics this role can publish to.
    #[serde(default)]
    pub publish: Vec<String>,
    /// Topic filters this role can subscribe to.
    #[serde(default)]
    pub subscribe: Vec<String>,
}

/// Permissions for clients without an explicit role.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DefaultPermissions {
    /// Topics that can be published to.
    pub publish: Vec<String>,
    /// Topic filters that can be subscribed to.
    pub subscribe: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_acl_section() {
        let acl: AclConfig = toml::from_str(
            r#"
enabled = true

[[roles]]
name = "sensor"
publish = ["sensors/%c/#"]

[anonymous]
subscribe = ["public/#"]
"#,
        )
        .unwrap();
        assert!(acl.enabled);
        assert_eq!(acl.roles[0].publish, vec!["sensors/%c/#".to_string()]);
        assert!(acl.roles[0].subscribe.is_empty());
        assert!(acl.default.publish.is_empty());
        assert_eq!(acl.anonymous.subscribe, vec!["public/#".to_string()]);
    }
}
