//! Per-client configuration.

use xds_api::pb::envoy::config::core::v3::{node::UserAgentVersionType, Node};

use crate::xds::ResourceType;

/// Behavior flags and embedder details for a single client, returned by a
/// [ClientConfigProvider][crate::api::ClientConfigProvider].
#[derive(Clone, Debug, Default)]
pub struct XdsConfig<D> {
    /// Opaque details passed to every resource builder call for this client.
    pub client_details: D,

    /// Don't push anything to this client until it has acknowledged its first
    /// message of this type.
    pub delay_updates_until_ack_of: Option<ResourceType>,

    /// Log NACKs from this client instead of dropping the connection.
    pub silent_nacks: bool,
}

impl<D> XdsConfig<D> {
    pub fn new(client_details: D) -> Self {
        Self {
            client_details,
            delay_updates_until_ack_of: None,
            silent_nacks: false,
        }
    }

    pub fn with_delay_updates_until_ack_of(mut self, rtype: ResourceType) -> Self {
        self.delay_updates_until_ack_of = Some(rtype);
        self
    }

    pub fn with_silent_nacks(mut self, silent_nacks: bool) -> Self {
        self.silent_nacks = silent_nacks;
        self
    }
}

/// An [XdsConfig] plus everything derived from the client's [Node].
#[derive(Clone, Debug)]
pub struct NodeConfig<D> {
    pub xds: XdsConfig<D>,

    /// Envoy before 1.19 resends its old resource list instead of a wildcard
    /// subscription when it reconnects.
    pub legacy_wildcard_reconnect: bool,
}

impl<D> NodeConfig<D> {
    pub fn new(node: &Node, xds: XdsConfig<D>) -> Self {
        Self {
            legacy_wildcard_reconnect: sends_resource_list_on_wildcard_reconnect(node),
            xds,
        }
    }

    pub fn details(&self) -> &D {
        &self.xds.client_details
    }
}

fn sends_resource_list_on_wildcard_reconnect(node: &Node) -> bool {
    if node.user_agent_name != "envoy" {
        return false;
    }

    let (major, minor) = match &node.user_agent_version_type {
        Some(UserAgentVersionType::UserAgentBuildVersion(build)) => build
            .version
            .as_ref()
            .map(|v| (v.major_number, v.minor_number))
            .unwrap_or_default(),
        _ => (0, 0),
    };

    major <= 1 && minor < 19
}

#[cfg(test)]
mod test {
    use super::*;
    use xds_api::pb::envoy::config::core::v3::BuildVersion;
    use xds_api::pb::envoy::r#type::v3::SemanticVersion;

    fn node(user_agent: &str, major: u32, minor: u32, patch: u32) -> Node {
        Node {
            id: "test-node".to_string(),
            user_agent_name: user_agent.to_string(),
            user_agent_version_type: Some(UserAgentVersionType::UserAgentBuildVersion(
                BuildVersion {
                    version: Some(SemanticVersion {
                        major_number: major,
                        minor_number: minor,
                        patch,
                    }),
                    ..Default::default()
                },
            )),
            ..Default::default()
        }
    }

    #[test]
    fn test_legacy_wildcard_reconnect() {
        let cases = [
            (node("envoy", 1, 17, 0), true),
            (node("envoy", 1, 18, 5), true),
            (node("envoy", 1, 19, 0), false),
            (node("envoy", 2, 0, 0), false),
            (node("bob", 1, 17, 0), false),
        ];

        for (node, expected) in cases {
            let config = NodeConfig::new(&node, XdsConfig::new(()));
            assert_eq!(
                config.legacy_wildcard_reconnect, expected,
                "wrong answer for {node:?}"
            );
        }
    }

    #[test]
    fn test_missing_build_version() {
        let node = Node {
            user_agent_name: "envoy".to_string(),
            ..Default::default()
        };
        assert!(NodeConfig::new(&node, XdsConfig::new(())).legacy_wildcard_reconnect);
        assert!(!NodeConfig::new(&Node::default(), XdsConfig::new(())).legacy_wildcard_reconnect);
    }
}
