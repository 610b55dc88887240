mod subscriptions;

use std::collections::BTreeSet;
use std::sync::Arc;

use smol_str::SmolStr;
use tracing::{debug, info};
use xds_api::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, Resource,
};

use crate::api::{NamedResource, ResourceBuilder, ResourceDiff, ResourceFilter, ResponseSink};
use crate::config::NodeConfig;
use crate::xds::session::SessionCore;
use crate::xds::{next_nonce, Protocol, ResourceType, TypeSession, XdsError, XdsProtocol};

use subscriptions::DeltaSubscriptions;

/// The incremental xDS protocol.
pub struct Delta;

impl XdsProtocol for Delta {
    type Request = DeltaDiscoveryRequest;
    type Response = DeltaDiscoveryResponse;

    const PROTOCOL: Protocol = Protocol::Delta;

    fn new_session<S, D>(
        rtype: ResourceType,
        sink: Arc<dyn ResponseSink<DeltaDiscoveryResponse>>,
        builder: Arc<dyn ResourceBuilder<S, D>>,
        config: Arc<NodeConfig<D>>,
    ) -> Box<dyn TypeSession<DeltaDiscoveryRequest, S>>
    where
        S: Send + Sync + 'static,
        D: Send + Sync + 'static,
    {
        Box::new(DeltaSession::new(rtype, sink, builder, config))
    }
}

/// A Delta session for a single resource type.
///
/// Delta responses only carry what changed, so unlike SOTW there's no need to
/// remember what the client has. Every response gets a fresh nonce and the
/// session waits for that nonce to come back.
pub(crate) struct DeltaSession<S, D> {
    core: SessionCore<S, D>,
    sink: Arc<dyn ResponseSink<DeltaDiscoveryResponse>>,
    subscriptions: DeltaSubscriptions,
    pending_nonce: Option<SmolStr>,
    version: u64,
}

impl<S, D> DeltaSession<S, D> {
    pub(crate) fn new(
        rtype: ResourceType,
        sink: Arc<dyn ResponseSink<DeltaDiscoveryResponse>>,
        builder: Arc<dyn ResourceBuilder<S, D>>,
        config: Arc<NodeConfig<D>>,
    ) -> Self {
        let subscriptions = DeltaSubscriptions::new(
            rtype.supports_wildcard(Protocol::Delta),
            config.legacy_wildcard_reconnect,
        );

        Self {
            core: SessionCore::new(rtype, builder, config),
            sink,
            subscriptions,
            pending_nonce: None,
            version: 0,
        }
    }

    /// Send the full state of everything newly subscribed to. Names the client
    /// asked for or already knows about that no longer exist are sent as
    /// removals.
    fn subscription_changed<'a>(
        &mut self,
        subscribe: &BTreeSet<SmolStr>,
        newly_subscribed: &dyn ResourceFilter,
        known: impl Iterator<Item = &'a String>,
    ) {
        let mut removed: BTreeSet<SmolStr> = subscribe
            .iter()
            .filter(|name| newly_subscribed.matches(name))
            .cloned()
            .collect();
        removed.extend(
            known
                .filter(|name| newly_subscribed.matches(name))
                .map(SmolStr::from),
        );

        let resources = self.core.resources(newly_subscribed);
        for resource in &resources {
            removed.remove(&resource.name);
        }

        self.push_resources(resources, removed.into_iter().collect());
    }

    fn push_resources(&mut self, resources: Vec<NamedResource>, removed: Vec<SmolStr>) {
        self.version += 1;
        let version = self.version.to_string();
        let nonce = next_nonce();

        let response = DeltaDiscoveryResponse {
            type_url: self.core.resource_type().type_url().to_string(),
            system_version_info: version.clone(),
            nonce: nonce.to_string(),
            resources: resources
                .into_iter()
                .map(|r| Resource {
                    name: r.name.to_string(),
                    version: version.clone(),
                    resource: Some(r.resource),
                    ..Default::default()
                })
                .collect(),
            removed_resources: removed.into_iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        };

        self.pending_nonce = Some(nonce);
        self.sink.send(response);
    }

    fn push_diff(&mut self, diff: Option<ResourceDiff>) {
        if let Some(diff) = diff.filter(|d| !d.is_empty()) {
            self.push_resources(diff.add_and_updates, diff.removes);
        }
    }
}

impl<S: Send + Sync, D: Send + Sync> TypeSession<DeltaDiscoveryRequest, S> for DeltaSession<S, D> {
    fn resource_type(&self) -> ResourceType {
        self.core.resource_type()
    }

    fn process_request(&mut self, request: &DeltaDiscoveryRequest) -> Result<(), XdsError> {
        self.core.check_request(&request.type_url)?;
        let rtype = self.core.resource_type();

        let is_ack = !request.response_nonce.is_empty();
        if is_ack {
            if self.pending_nonce.as_deref() == Some(request.response_nonce.as_str()) {
                if let Some(status) = &request.error_detail {
                    return Err(XdsError::Nack {
                        type_url: request.type_url.clone(),
                        nonce: request.response_nonce.clone(),
                        code: status.code,
                        message: status.message.clone(),
                    });
                }
                self.pending_nonce = None;
            } else if request.error_detail.is_some() {
                debug!(
                    ty = %rtype,
                    nonce = request.response_nonce,
                    "ignoring rejection of a stale response",
                );
            }
        }

        let subscribe: BTreeSet<SmolStr> = request
            .resource_names_subscribe
            .iter()
            .map(SmolStr::from)
            .collect();
        let unsubscribe: BTreeSet<SmolStr> = request
            .resource_names_unsubscribe
            .iter()
            .map(SmolStr::from)
            .collect();

        if let Some(newly_subscribed) = self.subscriptions.update(&subscribe, &unsubscribe)? {
            if is_ack {
                info!(
                    ty = %rtype,
                    nonce = request.response_nonce,
                    "client changed subscriptions in an ack",
                );
            }
            self.subscription_changed(
                &subscribe,
                &newly_subscribed,
                request.initial_resource_versions.keys(),
            );
        }

        Ok(())
    }

    fn awaiting_ack(&self) -> bool {
        self.pending_nonce.is_some()
    }

    fn init(&mut self, state: Arc<S>) {
        self.core.init(state)
    }

    fn on_network_update(&mut self, update: Arc<S>) {
        self.core.on_network_update(update)
    }

    fn push_pre(&mut self) {
        let diff = self.core.apply_pre(&self.subscriptions);
        self.push_diff(diff);
    }

    fn push_post(&mut self) {
        let diff = self.core.apply_post(&self.subscriptions);
        self.push_diff(diff);
    }
}
