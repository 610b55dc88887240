mod subscriptions;
mod version;

use std::collections::BTreeMap;
use std::sync::Arc;

use smol_str::SmolStr;
use tracing::debug;
use xds_api::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};

use crate::api::{NamedResource, ResourceBuilder, ResourceDiff, ResourceFilter, ResponseSink};
use crate::config::NodeConfig;
use crate::xds::session::SessionCore;
use crate::xds::{Phase, Protocol, ResourceType, TypeSession, XdsError, XdsProtocol};

use subscriptions::SotwSubscriptions;
use version::VersionTracker;

/// The state-of-the-world xDS protocol.
pub struct Sotw;

impl XdsProtocol for Sotw {
    type Request = DiscoveryRequest;
    type Response = DiscoveryResponse;

    const PROTOCOL: Protocol = Protocol::Sotw;

    fn new_session<S, D>(
        rtype: ResourceType,
        sink: Arc<dyn ResponseSink<DiscoveryResponse>>,
        builder: Arc<dyn ResourceBuilder<S, D>>,
        config: Arc<NodeConfig<D>>,
    ) -> Box<dyn TypeSession<DiscoveryRequest, S>>
    where
        S: Send + Sync + 'static,
        D: Send + Sync + 'static,
    {
        Box::new(SotwSession::new(rtype, sink, builder, config))
    }
}

/// A SOTW session for a single resource type.
///
/// Every SOTW response carries every resource the client is subscribed to,
/// so the session keeps a copy of everything it has sent.
pub(crate) struct SotwSession<S, D> {
    core: SessionCore<S, D>,
    sink: Arc<dyn ResponseSink<DiscoveryResponse>>,
    subscriptions: SotwSubscriptions,
    versions: VersionTracker,
    awaiting_version: Option<u64>,
    resources: BTreeMap<SmolStr, NamedResource>,
}

impl<S, D> SotwSession<S, D> {
    pub(crate) fn new(
        rtype: ResourceType,
        sink: Arc<dyn ResponseSink<DiscoveryResponse>>,
        builder: Arc<dyn ResourceBuilder<S, D>>,
        config: Arc<NodeConfig<D>>,
    ) -> Self {
        Self {
            core: SessionCore::new(rtype, builder, config),
            sink,
            subscriptions: SotwSubscriptions::new(rtype.supports_wildcard(Protocol::Sotw)),
            versions: VersionTracker::new(rtype),
            awaiting_version: None,
            resources: BTreeMap::new(),
        }
    }

    fn subscription_changed(&mut self, newly_subscribed: &dyn ResourceFilter) {
        let subscriptions = &self.subscriptions;
        let before = self.resources.len();
        self.resources.retain(|name, _| subscriptions.matches(name));
        let mut changed = self.resources.len() != before;

        for resource in self.core.resources(newly_subscribed) {
            self.resources.insert(resource.name.clone(), resource);
            changed = true;
        }

        // a push may be waiting on this type. apply it now so the response
        // below doesn't carry stale state.
        let applied = match self.core.phase() {
            Phase::Pre => self.apply_pre(),
            Phase::Post => self.apply_post(),
            Phase::Completed => false,
        };

        if changed || applied {
            self.push_resources();
        }
    }

    fn apply_pre(&mut self) -> bool {
        match self.core.apply_pre(&self.subscriptions) {
            Some(diff) => self.update_resources(diff),
            None => false,
        }
    }

    fn apply_post(&mut self) -> bool {
        match self.core.apply_post(&self.subscriptions) {
            Some(diff) => self.update_resources(diff),
            None => false,
        }
    }

    fn update_resources(&mut self, diff: ResourceDiff) -> bool {
        if diff.is_empty() {
            return false;
        }

        for resource in diff.add_and_updates {
            self.resources.insert(resource.name.clone(), resource);
        }
        for name in &diff.removes {
            self.resources.remove(name);
        }
        true
    }

    fn push_resources(&mut self) {
        let version = self.versions.next_version();
        let nonce = self.versions.pushed(version);
        self.awaiting_version = Some(version);

        let response = DiscoveryResponse {
            type_url: self.core.resource_type().type_url().to_string(),
            version_info: version.to_string(),
            nonce: nonce.to_string(),
            resources: self
                .resources
                .values()
                .map(|r| r.resource.clone())
                .collect(),
            ..Default::default()
        };
        self.sink.send(response);
    }
}

impl<S: Send + Sync, D: Send + Sync> TypeSession<DiscoveryRequest, S> for SotwSession<S, D> {
    fn resource_type(&self) -> ResourceType {
        self.core.resource_type()
    }

    fn process_request(&mut self, request: &DiscoveryRequest) -> Result<(), XdsError> {
        self.core.check_request(&request.type_url)?;

        if !self
            .versions
            .process_request(&request.response_nonce, &request.version_info)?
        {
            return Ok(());
        }

        if let Some(newly_subscribed) = self.subscriptions.update(&request.resource_names) {
            debug!(
                ty = %self.core.resource_type(),
                names = ?request.resource_names,
                "subscriptions changed",
            );
            self.subscription_changed(&newly_subscribed);
        }

        Ok(())
    }

    fn awaiting_ack(&self) -> bool {
        self.awaiting_version
            .is_some_and(|version| !self.versions.has_accepted(version))
    }

    fn init(&mut self, state: Arc<S>) {
        self.core.init(state)
    }

    fn on_network_update(&mut self, update: Arc<S>) {
        self.core.on_network_update(update)
    }

    fn push_pre(&mut self) {
        if self.apply_pre() {
            self.push_resources();
        }
    }

    fn push_post(&mut self) {
        if self.apply_post() {
            self.push_resources();
        }
    }
}
