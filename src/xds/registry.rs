use std::sync::Arc;
use std::time::SystemTime;

use crossbeam_skiplist::SkipMap;
use xds_api::pb::envoy::config::core::v3::Node;

use crate::api::{ClientId, XdsEventListener};
use crate::config::XdsConfig;

/// Tracks every connected client.
///
/// Register a registry as an event listener on a server and it keeps itself up
/// to date. Cloning a registry is cheap, and all clones share the same set of
/// clients.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<SkipMap<ConnectionKey, ConnectionInfo>>,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ConnectionKey {
    cluster: String,
    id: String,
    client: ClientId,
}

impl ConnectionKey {
    fn new(client: ClientId, node: &Node) -> Self {
        Self {
            cluster: node.cluster.clone(),
            id: node.id.clone(),
            client,
        }
    }
}

struct ConnectionInfo {
    node: Node,
    connected_at: SystemTime,
}

impl ConnectionRegistry {
    /// Iterate over connected clients, ordered by cluster and node id.
    pub fn iter(&self) -> impl Iterator<Item = ConnectionRegistryEntry<'_>> {
        self.connections.iter().map(ConnectionRegistryEntry)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl<D> XdsEventListener<D> for ConnectionRegistry {
    fn on_new_client(&self, client: ClientId, node: &Node, _: &XdsConfig<D>) -> anyhow::Result<()> {
        self.connections.insert(
            ConnectionKey::new(client, node),
            ConnectionInfo {
                node: node.clone(),
                connected_at: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn on_client_disconnected(&self, client: ClientId, node: &Node) -> anyhow::Result<()> {
        self.connections.remove(&ConnectionKey::new(client, node));
        Ok(())
    }
}

pub struct ConnectionRegistryEntry<'a>(
    crossbeam_skiplist::map::Entry<'a, ConnectionKey, ConnectionInfo>,
);

impl ConnectionRegistryEntry<'_> {
    pub fn client(&self) -> ClientId {
        self.0.key().client
    }

    pub fn node(&self) -> &Node {
        &self.0.value().node
    }

    pub fn connected_at(&self) -> SystemTime {
        self.0.value().connected_at
    }
}
