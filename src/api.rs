//! The interfaces an embedder implements to plug a network model into the xDS
//! engine, and the values that cross that boundary.

use std::{
    collections::BTreeSet,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use enum_map::EnumMap;
use smol_str::SmolStr;
use xds_api::pb::envoy::config::core::v3::Node;
use xds_api::pb::google::protobuf;

use crate::config::XdsConfig;
use crate::xds::ResourceType;

/// The resource name Delta clients use to ask for every resource of a type.
pub const WILDCARD: &str = "*";

/// A single xDS resource and the name it's known by.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedResource {
    pub name: SmolStr,
    pub resource: protobuf::Any,
}

impl NamedResource {
    pub fn new(name: impl Into<SmolStr>, resource: protobuf::Any) -> Self {
        Self {
            name: name.into(),
            resource,
        }
    }
}

/// The change a [ResourceBuilder] computes for one phase of a push.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceDiff {
    pub add_and_updates: Vec<NamedResource>,
    pub removes: Vec<SmolStr>,
}

impl ResourceDiff {
    pub fn is_empty(&self) -> bool {
        self.add_and_updates.is_empty() && self.removes.is_empty()
    }
}

/// A predicate over resource names.
pub trait ResourceFilter {
    fn matches(&self, name: &str) -> bool;
}

/// A set of resource names a client is asking for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NameFilter {
    /// Every resource.
    All,

    /// Exactly these names.
    Only(BTreeSet<SmolStr>),

    /// Every resource but these.
    Except(BTreeSet<SmolStr>),
}

impl NameFilter {
    pub fn nothing() -> Self {
        Self::Only(BTreeSet::new())
    }
}

impl ResourceFilter for NameFilter {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameFilter::All => name != WILDCARD,
            NameFilter::Only(names) => names.contains(name),
            NameFilter::Except(names) => name != WILDCARD && !names.contains(name),
        }
    }
}

/// Converts network state into xDS resources for a single resource type.
///
/// `S` is the embedder's network state (or a change to it) and `D` is the
/// per-client detail returned from a [ClientConfigProvider]. Builders should
/// only return resources that pass the `subscribed` filter they're given.
/// Anything else gets logged and sent anyway.
pub trait ResourceBuilder<S, D>: Send + Sync {
    /// Resources to add or update (and, rarely, remove) during the first half
    /// of a push.
    fn add_order(&self, update: &S, subscribed: &dyn ResourceFilter, details: &D) -> ResourceDiff;

    /// Resources to remove during the second half of a push.
    fn remove_order(&self, update: &S, subscribed: &dyn ResourceFilter, details: &D)
        -> ResourceDiff;

    /// The full set of resources matching `filter` before a push has applied
    /// its removals.
    fn resources_add_order(
        &self,
        state: &S,
        filter: &dyn ResourceFilter,
        details: &D,
    ) -> Vec<NamedResource>;

    /// The full set of resources matching `filter`.
    fn resources_remove_order(
        &self,
        state: &S,
        filter: &dyn ResourceFilter,
        details: &D,
    ) -> Vec<NamedResource>;
}

/// A [ResourceBuilder] for resource types that aren't served. Never returns
/// anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopBuilder;

impl<S, D> ResourceBuilder<S, D> for NoopBuilder {
    fn add_order(&self, _: &S, _: &dyn ResourceFilter, _: &D) -> ResourceDiff {
        ResourceDiff::default()
    }

    fn remove_order(&self, _: &S, _: &dyn ResourceFilter, _: &D) -> ResourceDiff {
        ResourceDiff::default()
    }

    fn resources_add_order(&self, _: &S, _: &dyn ResourceFilter, _: &D) -> Vec<NamedResource> {
        Vec::new()
    }

    fn resources_remove_order(&self, _: &S, _: &dyn ResourceFilter, _: &D) -> Vec<NamedResource> {
        Vec::new()
    }
}

/// The [ResourceBuilder] for every resource type.
pub struct Builders<S, D> {
    builders: EnumMap<ResourceType, Option<Arc<dyn ResourceBuilder<S, D>>>>,
}

impl<S, D> Default for Builders<S, D> {
    fn default() -> Self {
        Self {
            builders: EnumMap::default(),
        }
    }
}

impl<S, D> Clone for Builders<S, D> {
    fn clone(&self) -> Self {
        Self {
            builders: self.builders.clone(),
        }
    }
}

impl<S: 'static, D: 'static> Builders<S, D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, rtype: ResourceType, builder: impl ResourceBuilder<S, D> + 'static) -> Self {
        self.builders[rtype] = Some(Arc::new(builder));
        self
    }

    /// Returns the builder for `rtype`, or a [NoopBuilder] if nothing has been
    /// configured.
    pub fn get(&self, rtype: ResourceType) -> Arc<dyn ResourceBuilder<S, D>> {
        match &self.builders[rtype] {
            Some(builder) => builder.clone(),
            None => Arc::new(NoopBuilder),
        }
    }
}

/// A network update that can be combined with the update that follows it.
///
/// `a.merge(b)` must be equivalent to applying `a` and then `b`.
pub trait Mergeable: Sized {
    fn merge(self, next: Self) -> Self;
}

/// A process-unique id for one client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Receives network updates from a [NetworkSource].
pub trait NetworkListener<S>: Send + Sync {
    fn on_network_change(&self, update: S);

    /// Called when updates stopped being delivered because something went
    /// wrong. The listener is closed right after.
    fn on_error(&self, _error: anyhow::Error) {}

    /// Called once when the listener will not receive any more updates.
    fn close(&self) {}
}

/// The source of network state.
pub trait NetworkSource<S>: Send + Sync {
    /// Start delivering updates to `listener` and return the current state.
    ///
    /// The returned state and the first update delivered must line up: no
    /// change may be skipped or delivered twice. Updates must not be delivered
    /// from inside `subscribe` itself.
    fn subscribe(&self, client: ClientId, listener: Arc<dyn NetworkListener<S>>) -> S;

    /// Stop delivering updates to the listener for `client` and call its
    /// [NetworkListener::close].
    fn unsubscribe(&self, client: ClientId);
}

/// Looks up the configuration for a newly connected client.
pub trait ClientConfigProvider<D>: Send + Sync {
    fn lookup(&self, node: &Node, remote_addr: Option<SocketAddr>) -> XdsConfig<D>;
}

/// Notified when clients connect and disconnect.
pub trait XdsEventListener<D>: Send + Sync {
    fn on_new_client(&self, client: ClientId, node: &Node, config: &XdsConfig<D>) -> anyhow::Result<()>;

    fn on_client_disconnected(&self, client: ClientId, node: &Node) -> anyhow::Result<()>;
}

/// Where a session sends its responses.
pub trait ResponseSink<T>: Send + Sync {
    fn send(&self, response: T);

    /// End the stream with an error so the client reconnects.
    fn fail(&self, status: tonic::Status);
}

impl<T: Send> ResponseSink<T> for tokio::sync::mpsc::UnboundedSender<Result<T, tonic::Status>> {
    fn send(&self, response: T) {
        if tokio::sync::mpsc::UnboundedSender::send(self, Ok(response)).is_err() {
            tracing::debug!("response channel closed, dropping response");
        }
    }

    fn fail(&self, status: tonic::Status) {
        if tokio::sync::mpsc::UnboundedSender::send(self, Err(status)).is_err() {
            tracing::debug!("response channel closed, dropping error");
        }
    }
}
