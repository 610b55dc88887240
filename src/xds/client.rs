use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{error, info, trace};
use xds_api::pb::envoy::config::core::v3::Node;

use crate::api::{
    Builders, ClientConfigProvider, ClientId, NetworkListener, NetworkSource, ResourceBuilder,
    ResponseSink, XdsEventListener,
};
use crate::backlog::{BacklogFactory, FifoBacklog};
use crate::config::NodeConfig;
use crate::metrics::{MetricsFactory, SessionMetrics, XdsMetrics};
use crate::relay::{QueueingRelay, RelayStrategy};
use crate::xds::{
    Protocol, PushOrchestrator, ResourceType, Teardown, XdsError, XdsProtocol, XdsRequest,
    ADD_ORDER, REMOVE_ORDER,
};

/// Everything a server needs to build a session for each new client.
pub struct ServerOptions<S, D> {
    pub(crate) builders: Builders<S, D>,
    pub(crate) source: Arc<dyn NetworkSource<S>>,
    pub(crate) config: Arc<dyn ClientConfigProvider<D>>,
    pub(crate) listeners: Vec<Arc<dyn XdsEventListener<D>>>,
    pub(crate) backlog: Arc<dyn BacklogFactory<S>>,
    pub(crate) relay: Option<RelayStrategy<S>>,
    pub(crate) metrics: Arc<MetricsFactory>,
}

impl<S, D> ServerOptions<S, D>
where
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// Serve network state from `source`, configuring each client with
    /// `config`.
    ///
    /// By default no resource types have builders, and network updates are
    /// relayed and backlogged in order.
    pub fn new(
        source: Arc<dyn NetworkSource<S>>,
        config: Arc<dyn ClientConfigProvider<D>>,
    ) -> Self {
        Self {
            builders: Builders::new(),
            source,
            config,
            listeners: Vec::new(),
            backlog: Arc::new(FifoBacklog::<S>::factory()),
            relay: Some(RelayStrategy::Fifo),
            metrics: Arc::from(XdsMetrics::factory()),
        }
    }

    pub fn with_builders(mut self, builders: Builders<S, D>) -> Self {
        self.builders = builders;
        self
    }

    pub fn with_builder(
        mut self,
        rtype: ResourceType,
        builder: impl ResourceBuilder<S, D> + 'static,
    ) -> Self {
        self.builders = self.builders.with(rtype, builder);
        self
    }

    pub fn with_event_listener(mut self, listener: Arc<dyn XdsEventListener<D>>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_backlog(mut self, backlog: impl BacklogFactory<S> + 'static) -> Self {
        self.backlog = Arc::new(backlog);
        self
    }

    /// Set how network updates are handed from the source to each client's
    /// [QueueingRelay].
    pub fn with_relay(mut self, strategy: RelayStrategy<S>) -> Self {
        self.relay = Some(strategy);
        self
    }

    /// Deliver network updates to clients directly on the source's thread.
    /// Sessions created without a relay don't need a tokio runtime.
    pub fn without_relay(mut self) -> Self {
        self.relay = None;
        self
    }

    pub fn with_metrics(
        mut self,
        metrics: impl Fn(Protocol) -> Box<dyn SessionMetrics> + Send + Sync + 'static,
    ) -> Self {
        self.metrics = Arc::new(metrics);
        self
    }
}

/// The server side of a single xDS stream.
///
/// A session is created for every new stream. It learns who the client is from
/// the first request, subscribes to the network source, and pushes changes to
/// the client until it's closed.
pub struct ClientSession<P: XdsProtocol, S, D> {
    id: ClientId,
    remote_addr: Option<SocketAddr>,
    options: Arc<ServerOptions<S, D>>,
    sink: Arc<dyn ResponseSink<P::Response>>,
    state: Mutex<ClientState<P::Request, S, D>>,
}

struct ClientState<R, S, D> {
    dead: bool,
    node: Option<Node>,
    config: Option<Arc<NodeConfig<D>>>,
    orchestrator: Option<PushOrchestrator<R, S>>,
    relay: Option<Arc<QueueingRelay<S>>>,
}

impl<P, S, D> ClientSession<P, S, D>
where
    P: XdsProtocol,
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub fn new(
        id: ClientId,
        remote_addr: Option<SocketAddr>,
        options: Arc<ServerOptions<S, D>>,
        sink: Arc<dyn ResponseSink<P::Response>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote_addr,
            options,
            sink,
            state: Mutex::new(ClientState {
                dead: false,
                node: None,
                config: None,
                orchestrator: None,
                relay: None,
            }),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Handle a request from the client.
    ///
    /// Any error returned here should end the stream.
    pub fn handle_request(self: &Arc<Self>, request: &P::Request) -> Result<(), XdsError> {
        let mut state = self.lock();
        assert!(!state.dead, "{} got a request after it was closed", self.id);

        let config = match &state.config {
            Some(config) => config.clone(),
            None => self.connect(&mut state, request)?,
        };

        if let Some(status) = request.error_detail() {
            let silent = config.xds.silent_nacks && status.code == tonic::Code::Internal as i32;
            if silent {
                info!(
                    client = %self.id,
                    ty = request.type_url(),
                    nonce = request.response_nonce(),
                    code = status.code,
                    error_message = status.message,
                    "client rejected a response",
                );
            } else {
                error!(
                    client = %self.id,
                    ty = request.type_url(),
                    nonce = request.response_nonce(),
                    code = status.code,
                    error_message = status.message,
                    "client rejected a response",
                );
            }
        }

        if ResourceType::from_type_url(request.type_url()).is_none() {
            return Err(XdsError::protocol(format!(
                "unknown type url: {:?}",
                request.type_url()
            )));
        }

        if state.orchestrator.is_none() {
            self.subscribe(&mut state, &config);
        }
        let Some(orchestrator) = state.orchestrator.as_mut() else {
            unreachable!("{} has no orchestrator after subscribing", self.id);
        };

        match orchestrator.process_update(request) {
            Err(e) if e.is_nack() && config.xds.silent_nacks => {
                info!(client = %self.id, err = %e, "ignoring rejected response");
                Ok(())
            }
            result => result,
        }
    }

    /// Push a network update to the client. Updates are ignored once the
    /// session is closed.
    pub fn on_network_change(&self, update: S) {
        let mut state = self.lock();
        if state.dead {
            trace!(client = %self.id, "session closed, ignoring network update");
            return;
        }

        match state.orchestrator.as_mut() {
            Some(orchestrator) => orchestrator.push_update(update),
            None => trace!(client = %self.id, "session not subscribed, ignoring network update"),
        }
    }

    /// Close the session, unsubscribing from the network source and notifying
    /// event listeners. Every step runs even if an earlier one fails.
    ///
    /// Closing an already closed session does nothing.
    pub fn close(&self) -> anyhow::Result<()> {
        let (node, orchestrator, relay) = {
            let mut state = self.lock();
            if state.dead {
                return Ok(());
            }
            state.dead = true;
            (
                state.node.take(),
                state.orchestrator.take(),
                state.relay.take(),
            )
        };

        let mut teardown = Teardown::default();
        let subscribed = orchestrator.is_some();

        if subscribed {
            teardown.run("unsubscribe", || {
                self.options.source.unsubscribe(self.id);
                Ok(())
            });
        }
        if let Some(mut orchestrator) = orchestrator {
            teardown.run("close orchestrator", || {
                orchestrator.close();
                Ok(())
            });
        }
        if let Some(relay) = relay {
            teardown.run("close relay", || {
                relay.close();
                Ok(())
            });
        }
        if let Some(node) = &node {
            for listener in &self.options.listeners {
                teardown.run("client disconnected", || {
                    listener.on_client_disconnected(self.id, node)
                });
            }
            info!(
                client = %self.id,
                node = %node.id,
                cluster = %node.cluster,
                "client disconnected",
            );
        }

        teardown.finish()
    }

    /// End the stream with an error. The session is closed once the stream
    /// shuts down.
    fn fail(&self, error: anyhow::Error) {
        error!(client = %self.id, err = %format!("{error:#}"), "session failed, ending stream");
        self.sink.fail(tonic::Status::internal(error.to_string()));
    }

    fn lock(&self) -> MutexGuard<'_, ClientState<P::Request, S, D>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle the first message on the stream: figure out who the client is
    /// and tell everyone that cares.
    fn connect(
        &self,
        state: &mut ClientState<P::Request, S, D>,
        request: &P::Request,
    ) -> Result<Arc<NodeConfig<D>>, XdsError> {
        let node = request.node().cloned().ok_or(XdsError::MissingNode)?;
        let xds = self.options.config.lookup(&node, self.remote_addr);

        info!(
            client = %self.id,
            node = %node.id,
            cluster = %node.cluster,
            protocol = P::PROTOCOL.as_str(),
            remote_addr = ?self.remote_addr,
            "new client",
        );

        let config = Arc::new(NodeConfig::new(&node, xds));
        state.node = Some(node);
        state.config = Some(config.clone());

        // every listener hears about the client, even if one fails, so each
        // of them sees a matching disconnect when the session closes.
        let mut notify = Teardown::default();
        if let Some(node) = &state.node {
            for listener in &self.options.listeners {
                notify.run("client connected", || {
                    listener.on_new_client(self.id, node, &config.xds)
                });
            }
        }
        notify.finish().map_err(XdsError::Listener)?;

        Ok(config)
    }

    /// Build an orchestrator with a session for every resource type and start
    /// listening for network updates.
    fn subscribe(
        self: &Arc<Self>,
        state: &mut ClientState<P::Request, S, D>,
        config: &Arc<NodeConfig<D>>,
    ) {
        let sessions = ResourceType::all()
            .iter()
            .map(|rtype| {
                P::new_session(
                    *rtype,
                    self.sink.clone(),
                    self.options.builders.get(*rtype),
                    config.clone(),
                )
            })
            .collect();

        let mut orchestrator = PushOrchestrator::new(
            sessions,
            &ADD_ORDER,
            &REMOVE_ORDER,
            self.options.backlog.build(),
            (self.options.metrics)(P::PROTOCOL),
        );

        let listener: Arc<dyn NetworkListener<S>> = Arc::new(SessionListener {
            session: Arc::downgrade(self),
        });
        let listener = match &self.options.relay {
            Some(strategy) => {
                let relay = QueueingRelay::spawn(strategy.clone(), listener);
                state.relay = Some(relay.clone());
                relay
            }
            None => listener,
        };

        let initial = self.options.source.subscribe(self.id, listener);
        orchestrator.init(initial, config.xds.delay_updates_until_ack_of);
        state.orchestrator = Some(orchestrator);
    }
}

/// Forwards network updates to a session without keeping it alive.
struct SessionListener<P: XdsProtocol, S, D> {
    session: Weak<ClientSession<P, S, D>>,
}

impl<P, S, D> NetworkListener<S> for SessionListener<P, S, D>
where
    P: XdsProtocol,
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn on_network_change(&self, update: S) {
        if let Some(session) = self.session.upgrade() {
            session.on_network_change(update);
        }
    }

    fn on_error(&self, error: anyhow::Error) {
        if let Some(session) = self.session.upgrade() {
            session.fail(error);
        }
    }
}
