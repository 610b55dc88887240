use std::sync::Arc;

use crate::api::{NamedResource, ResourceBuilder, ResourceDiff, ResourceFilter, ResponseSink};
use crate::config::NodeConfig;
use crate::xds::{Protocol, ResourceType, XdsError, XdsRequest};

/// Where a single resource type is in the current push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Nothing is being pushed.
    Completed,

    /// A network update has arrived and additions have not been sent yet.
    Pre,

    /// Additions have been sent and removals have not.
    Post,
}

/// The per-resource-type half of an xDS session. A [PushOrchestrator]
/// drives one of these for every resource type a client may ask for.
///
/// [PushOrchestrator]: crate::xds::PushOrchestrator
pub trait TypeSession<R, S>: Send {
    fn resource_type(&self) -> ResourceType;

    /// Handle an inbound request for this session's resource type.
    fn process_request(&mut self, request: &R) -> Result<(), XdsError>;

    /// Whether the last response sent has not been acknowledged yet.
    fn awaiting_ack(&self) -> bool;

    fn init(&mut self, state: Arc<S>);

    /// Record the network update to apply in the next push.
    fn on_network_update(&mut self, update: Arc<S>);

    /// Send additions and updates for the pending network update.
    fn push_pre(&mut self);

    /// Send removals for the pending network update.
    fn push_post(&mut self);
}

/// The wire types and session constructor for a flavor of the xDS protocol.
pub trait XdsProtocol: Send + Sync + 'static {
    type Request: XdsRequest + Send + 'static;
    type Response: Send + 'static;

    const PROTOCOL: Protocol;

    fn new_session<S, D>(
        rtype: ResourceType,
        sink: Arc<dyn ResponseSink<Self::Response>>,
        builder: Arc<dyn ResourceBuilder<S, D>>,
        config: Arc<NodeConfig<D>>,
    ) -> Box<dyn TypeSession<Self::Request, S>>
    where
        S: Send + Sync + 'static,
        D: Send + Sync + 'static;
}

/// The state machine shared by SOTW and Delta sessions. Tracks the current
/// network state, the phase of the current push, and whether the client has
/// ever asked for this resource type.
pub(crate) struct SessionCore<S, D> {
    rtype: ResourceType,
    builder: Arc<dyn ResourceBuilder<S, D>>,
    config: Arc<NodeConfig<D>>,
    state: Option<Arc<S>>,
    phase: Phase,
    active: bool,
}

impl<S, D> SessionCore<S, D> {
    pub(crate) fn new(
        rtype: ResourceType,
        builder: Arc<dyn ResourceBuilder<S, D>>,
        config: Arc<NodeConfig<D>>,
    ) -> Self {
        Self {
            rtype,
            builder,
            config,
            state: None,
            phase: Phase::Completed,
            active: false,
        }
    }

    pub(crate) fn resource_type(&self) -> ResourceType {
        self.rtype
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Check that a request is for this session's resource type and mark the
    /// session active. Once a client has asked for a type, it gets pushes for
    /// it.
    pub(crate) fn check_request(&mut self, type_url: &str) -> Result<(), XdsError> {
        assert!(
            self.state.is_some(),
            "{} session got a request before it was initialized",
            self.rtype
        );

        if type_url != self.rtype.type_url() {
            return Err(XdsError::protocol(format!(
                "{} session got a request for {type_url:?}",
                self.rtype
            )));
        }

        self.active = true;
        Ok(())
    }

    pub(crate) fn init(&mut self, state: Arc<S>) {
        assert!(
            self.state.is_none(),
            "{} session initialized twice",
            self.rtype
        );
        self.state = Some(state);
    }

    pub(crate) fn on_network_update(&mut self, update: Arc<S>) {
        assert!(
            self.state.is_some(),
            "{} session got a network update before it was initialized",
            self.rtype
        );
        assert_eq!(
            self.phase,
            Phase::Completed,
            "{} session got a network update while a push was in flight",
            self.rtype
        );

        self.state = Some(update);
        self.phase = Phase::Pre;
    }

    /// Compute the additions for the pending update. Returns `None` if the
    /// session isn't in the PRE phase or the client has never asked for this
    /// type.
    pub(crate) fn apply_pre(&mut self, subscribed: &dyn ResourceFilter) -> Option<ResourceDiff> {
        if self.phase != Phase::Pre {
            return None;
        }
        self.phase = Phase::Post;

        if !self.active {
            return None;
        }

        let state = self.current_state();
        let diff = self
            .builder
            .add_order(state, subscribed, self.config.details());
        self.check_diff(&diff, subscribed);
        Some(diff)
    }

    /// Compute the removals for the pending update. Returns `None` if the
    /// session isn't in the POST phase or the client has never asked for this
    /// type.
    pub(crate) fn apply_post(&mut self, subscribed: &dyn ResourceFilter) -> Option<ResourceDiff> {
        if self.phase != Phase::Post {
            return None;
        }
        self.phase = Phase::Completed;

        if !self.active {
            return None;
        }

        let state = self.current_state();
        let diff = self
            .builder
            .remove_order(state, subscribed, self.config.details());
        self.check_diff(&diff, subscribed);
        Some(diff)
    }

    /// The full set of resources that match `filter`. Until the pending push
    /// has sent its additions, this is the view of the world from before any
    /// removals.
    pub(crate) fn resources(&self, filter: &dyn ResourceFilter) -> Vec<NamedResource> {
        let state = self.current_state();
        let details = self.config.details();

        let resources = match self.phase {
            Phase::Pre => self.builder.resources_add_order(state, filter, details),
            _ => self.builder.resources_remove_order(state, filter, details),
        };
        self.check_names(resources.iter().map(|r| r.name.as_str()), filter);
        resources
    }

    fn current_state(&self) -> &S {
        match &self.state {
            Some(state) => state,
            None => panic!("{} session used before it was initialized", self.rtype),
        }
    }

    fn check_diff(&self, diff: &ResourceDiff, filter: &dyn ResourceFilter) {
        let added = diff.add_and_updates.iter().map(|r| r.name.as_str());
        let removed = diff.removes.iter().map(|name| name.as_str());
        self.check_names(added.chain(removed), filter);
    }

    fn check_names<'a>(&self, names: impl IntoIterator<Item = &'a str>, filter: &dyn ResourceFilter) {
        let unexpected = unsubscribed(names, filter);
        if !unexpected.is_empty() {
            tracing::warn!(
                ty = %self.rtype,
                names = ?unexpected,
                "resource builder returned resources the client is not subscribed to",
            );
        }
    }
}

fn unsubscribed<'a>(
    names: impl IntoIterator<Item = &'a str>,
    filter: &dyn ResourceFilter,
) -> Vec<&'a str> {
    names.into_iter().filter(|name| !filter.matches(name)).collect()
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use xds_api::pb::envoy::config::core::v3::Node;
    use xds_api::pb::google::protobuf;

    use super::*;
    use crate::api::NameFilter;
    use crate::config::XdsConfig;

    /// Network state for tests: the name and payload of every resource of
    /// every type, before and after the current change.
    #[derive(Clone, Debug, Default, PartialEq)]
    pub(crate) struct TestState {
        pub before: BTreeMap<String, String>,
        pub after: BTreeMap<String, String>,
    }

    impl TestState {
        pub(crate) fn new(resources: &[(&str, &str)]) -> Self {
            let after: BTreeMap<_, _> = resources
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            Self {
                before: after.clone(),
                after,
            }
        }

        pub(crate) fn then(&self, resources: &[(&str, &str)]) -> Self {
            let next = Self::new(resources);
            Self {
                before: self.after.clone(),
                after: next.after,
            }
        }
    }

    pub(crate) fn anything(value: &str) -> protobuf::Any {
        protobuf::Any {
            type_url: "type.googleapis.com/test.Thing".to_string(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn named(resources: &BTreeMap<String, String>, filter: &dyn ResourceFilter) -> Vec<NamedResource> {
        resources
            .iter()
            .filter(|(name, _)| filter.matches(name))
            .map(|(name, value)| NamedResource::new(name.as_str(), anything(value)))
            .collect()
    }

    /// Adds everything that's new or changed in PRE, and removes everything
    /// that's gone in POST.
    pub(crate) struct TestBuilder;

    impl ResourceBuilder<TestState, ()> for TestBuilder {
        fn add_order(&self, update: &TestState, subscribed: &dyn ResourceFilter, _: &()) -> ResourceDiff {
            let changed: BTreeMap<_, _> = update
                .after
                .iter()
                .filter(|(k, v)| update.before.get(*k) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            ResourceDiff {
                add_and_updates: named(&changed, subscribed),
                removes: vec![],
            }
        }

        fn remove_order(&self, update: &TestState, subscribed: &dyn ResourceFilter, _: &()) -> ResourceDiff {
            let removes = update
                .before
                .keys()
                .filter(|k| !update.after.contains_key(*k) && subscribed.matches(k))
                .map(|k| k.into())
                .collect();

            ResourceDiff {
                add_and_updates: vec![],
                removes,
            }
        }

        fn resources_add_order(&self, state: &TestState, filter: &dyn ResourceFilter, _: &()) -> Vec<NamedResource> {
            let mut all = state.before.clone();
            all.extend(state.after.clone());
            named(&all, filter)
        }

        fn resources_remove_order(&self, state: &TestState, filter: &dyn ResourceFilter, _: &()) -> Vec<NamedResource> {
            named(&state.after, filter)
        }
    }

    /// A sink that remembers everything sent to it.
    pub(crate) struct RecordingSink<T> {
        sent: Mutex<Vec<T>>,
        failed: Mutex<Vec<tonic::Status>>,
    }

    impl<T> RecordingSink<T> {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(vec![]),
                failed: Mutex::new(vec![]),
            })
        }

        pub(crate) fn take(&self) -> Vec<T> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        pub(crate) fn failures(&self) -> Vec<tonic::Code> {
            self.failed.lock().unwrap().iter().map(|s| s.code()).collect()
        }
    }

    impl<T: Send> ResponseSink<T> for RecordingSink<T> {
        fn send(&self, response: T) {
            self.sent.lock().unwrap().push(response);
        }

        fn fail(&self, status: tonic::Status) {
            self.failed.lock().unwrap().push(status);
        }
    }

    /// Send logs to the test harness. Set RUST_LOG to see them.
    pub(crate) fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    pub(crate) fn node_config(legacy: bool) -> Arc<NodeConfig<()>> {
        let mut config = NodeConfig::new(&Node::default(), XdsConfig::new(()));
        config.legacy_wildcard_reconnect = legacy;
        Arc::new(config)
    }

    fn core() -> SessionCore<TestState, ()> {
        SessionCore::new(ResourceType::Cluster, Arc::new(TestBuilder), node_config(false))
    }

    #[test]
    fn test_inactive_session_never_builds() {
        let mut core = core();
        core.init(Arc::new(TestState::new(&[("a", "1")])));
        core.on_network_update(Arc::new(TestState::new(&[("a", "1")]).then(&[("b", "1")])));

        assert_eq!(core.phase(), Phase::Pre);
        assert_eq!(core.apply_pre(&NameFilter::All), None);
        assert_eq!(core.phase(), Phase::Post);
        assert_eq!(core.apply_post(&NameFilter::All), None);
        assert_eq!(core.phase(), Phase::Completed);
    }

    #[test]
    fn test_pre_then_post() {
        let mut core = core();
        core.init(Arc::new(TestState::new(&[("a", "1")])));
        core.check_request(ResourceType::Cluster.type_url()).unwrap();

        // nothing happens outside of a push
        assert_eq!(core.apply_pre(&NameFilter::All), None);
        assert_eq!(core.apply_post(&NameFilter::All), None);

        core.on_network_update(Arc::new(TestState::new(&[("a", "1")]).then(&[("b", "1")])));

        // post before pre does nothing
        assert_eq!(core.apply_post(&NameFilter::All), None);

        let pre = core.apply_pre(&NameFilter::All).unwrap();
        assert_eq!(pre.add_and_updates, vec![NamedResource::new("b", anything("1"))]);

        let post = core.apply_post(&NameFilter::All).unwrap();
        assert_eq!(post.removes, vec!["a"]);
        assert_eq!(core.phase(), Phase::Completed);
    }

    #[test]
    fn test_wrong_type_url() {
        let mut core = core();
        core.init(Arc::new(TestState::default()));

        let err = core
            .check_request(ResourceType::Listener.type_url())
            .unwrap_err();
        assert!(matches!(err, XdsError::ProtocolViolation(_)), "err={err:?}");
    }

    #[test]
    fn test_resources_follow_phase() {
        let mut core = core();
        core.init(Arc::new(TestState::new(&[("a", "1")])));
        core.on_network_update(Arc::new(TestState::new(&[("a", "1")]).then(&[("b", "1")])));

        let names = |resources: Vec<NamedResource>| -> Vec<_> {
            resources.into_iter().map(|r| r.name).collect()
        };

        // in PRE, nothing has been removed yet
        assert_eq!(names(core.resources(&NameFilter::All)), vec!["a", "b"]);
        core.apply_pre(&NameFilter::All);
        assert_eq!(names(core.resources(&NameFilter::All)), vec!["b"]);
    }

    #[test]
    #[should_panic]
    fn test_double_init() {
        let mut core = core();
        core.init(Arc::new(TestState::default()));
        core.init(Arc::new(TestState::default()));
    }

    #[test]
    fn test_unsubscribed_names() {
        let filter = NameFilter::Only(["a".into(), "b".into()].into_iter().collect());
        let diff = ResourceDiff {
            add_and_updates: vec![NamedResource::new("a", anything("1"))],
            removes: vec!["b".into(), "c".into()],
        };

        let added = diff.add_and_updates.iter().map(|r| r.name.as_str());
        let removed = diff.removes.iter().map(|name| name.as_str());
        assert_eq!(unsubscribed(added.chain(removed), &filter), vec!["c"]);
        assert!(unsubscribed(["a", "b"], &filter).is_empty());
    }

    #[test]
    #[should_panic]
    fn test_request_before_init() {
        let mut core = core();
        let _ = core.check_request(ResourceType::Cluster.type_url());
    }

    #[test]
    #[should_panic]
    fn test_overlapping_updates() {
        let mut core = core();
        core.init(Arc::new(TestState::default()));
        core.on_network_update(Arc::new(TestState::default()));
        core.on_network_update(Arc::new(TestState::default()));
    }
}
