use std::sync::Arc;

use enum_map::EnumMap;
use tracing::{debug, trace};

use crate::backlog::UpdateBacklog;
use crate::metrics::SessionMetrics;
use crate::xds::{Phase, ResourceType, TypeSession, XdsError, XdsRequest};

/// Sequences network updates across every resource type for a single client.
///
/// A push sends additions for each resource type in add order, then removals
/// in remove order, waiting for the client to acknowledge each message before
/// moving on to the next type. Network updates that arrive while a push is in
/// flight, or while the client has any unacknowledged message, wait in a
/// backlog.
///
/// The orchestrator isn't synchronized. Callers must serialize every call.
pub struct PushOrchestrator<R, S> {
    sessions: EnumMap<ResourceType, Option<Box<dyn TypeSession<R, S>>>>,
    add_order: Vec<ResourceType>,
    remove_order: Vec<ResourceType>,
    backlog: Box<dyn UpdateBacklog<S>>,
    metrics: Box<dyn SessionMetrics>,

    outstanding_acks: EnumMap<ResourceType, bool>,
    delay_until_ack_of: Option<ResourceType>,
    initialized: bool,
    closed: bool,

    // the in-flight push
    current: Option<Arc<S>>,
    phase: Phase,
    cursor: usize,
    waiting_on: Option<ResourceType>,
}

impl<R: XdsRequest, S> PushOrchestrator<R, S> {
    /// Create a new orchestrator that pushes to `sessions` in the given orders.
    ///
    /// Every type in either order must have a session.
    pub fn new(
        sessions: Vec<Box<dyn TypeSession<R, S>>>,
        add_order: &[ResourceType],
        remove_order: &[ResourceType],
        backlog: Box<dyn UpdateBacklog<S>>,
        metrics: Box<dyn SessionMetrics>,
    ) -> Self {
        let mut by_type: EnumMap<ResourceType, Option<Box<dyn TypeSession<R, S>>>> =
            EnumMap::default();
        for session in sessions {
            let rtype = session.resource_type();
            assert!(by_type[rtype].is_none(), "duplicate session for {rtype}");
            by_type[rtype] = Some(session);
        }

        assert!(!add_order.is_empty(), "add order can't be empty");
        assert!(!remove_order.is_empty(), "remove order can't be empty");
        for rtype in add_order.iter().chain(remove_order) {
            assert!(by_type[*rtype].is_some(), "no session for {rtype}");
        }

        Self {
            sessions: by_type,
            add_order: add_order.to_vec(),
            remove_order: remove_order.to_vec(),
            backlog,
            metrics,
            outstanding_acks: EnumMap::default(),
            delay_until_ack_of: None,
            initialized: false,
            closed: false,
            current: None,
            phase: Phase::Completed,
            cursor: 0,
            waiting_on: None,
        }
    }

    /// Initialize every session with the same starting state. With
    /// `delay_until_ack_of` set, nothing is pushed until the client has
    /// acknowledged its first message of that type.
    pub fn init(&mut self, initial: S, delay_until_ack_of: Option<ResourceType>) {
        assert!(!self.initialized, "orchestrator initialized twice");
        assert!(!self.closed, "orchestrator initialized after close");

        let initial = Arc::new(initial);
        for session in self.sessions.values_mut().flatten() {
            session.init(initial.clone());
        }

        self.delay_until_ack_of = delay_until_ack_of;
        self.initialized = true;
    }

    /// Handle a request from the client.
    pub fn process_update(&mut self, request: &R) -> Result<(), XdsError> {
        self.assert_usable();

        let rtype = ResourceType::from_type_url(request.type_url()).ok_or_else(|| {
            XdsError::protocol(format!("unknown type url: {:?}", request.type_url()))
        })?;
        let session = self.sessions[rtype]
            .as_mut()
            .ok_or_else(|| XdsError::protocol(format!("{rtype} is not served")))?;

        session.process_request(request)?;
        self.track_ack(rtype);

        if self.current.is_some() {
            self.continue_push();
        } else if self.push_allowed() {
            self.push_backlog();
        }

        Ok(())
    }

    /// Push a network update to the client now if nothing is in flight, or
    /// save it for later.
    pub fn push_update(&mut self, update: S) {
        self.assert_usable();

        if self.current.is_none() && self.push_allowed() {
            self.begin_push(Arc::new(update));
            self.continue_push();
        } else {
            trace!("push in progress, saving update for later");
            self.backlog.put(update);
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.metrics.close();
    }

    pub fn is_pushing(&self) -> bool {
        self.current.is_some()
    }

    /// Keep the set of types with unacknowledged messages in sync with the
    /// sessions.
    fn track_ack(&mut self, rtype: ResourceType) {
        let awaiting = self.session(rtype).awaiting_ack();

        if awaiting && !self.outstanding_acks[rtype] {
            self.outstanding_acks[rtype] = true;
            self.metrics.on_awaiting_ack();
        } else if !awaiting && self.outstanding_acks[rtype] {
            self.outstanding_acks[rtype] = false;
            self.metrics.on_message_acked();

            if self.delay_until_ack_of == Some(rtype) {
                debug!(ty = %rtype, "first ack received, releasing delayed updates");
                self.delay_until_ack_of = None;
            }
        }
    }

    fn push_allowed(&self) -> bool {
        self.delay_until_ack_of.is_none() && !self.outstanding_acks.values().any(|a| *a)
    }

    fn push_backlog(&mut self) {
        if let Some(update) = self.backlog.take() {
            self.begin_push(Arc::new(update));
            self.continue_push();
        }
    }

    /// Start a new push and send additions for the first resource type.
    fn begin_push(&mut self, update: Arc<S>) {
        assert!(self.current.is_none(), "push started while another is in flight");

        self.metrics.on_push_begin();
        for session in self.sessions.values_mut().flatten() {
            session.on_network_update(update.clone());
        }

        self.current = Some(update);
        self.phase = Phase::Pre;
        self.cursor = 0;
        self.waiting_on = self.next_type();
        if let Some(rtype) = self.waiting_on {
            self.session(rtype).push_pre();
            self.track_ack(rtype);
        }
    }

    /// Move the in-flight push along until it's waiting on an ack or it's
    /// done. Resource types that had nothing to send are skipped over, and a
    /// finished push immediately starts on the backlog.
    fn continue_push(&mut self) {
        loop {
            self.assert_usable();

            let Some(waiting_on) = self.waiting_on else {
                return;
            };
            if self.session(waiting_on).awaiting_ack() {
                trace!(ty = %waiting_on, "waiting for ack");
                return;
            }

            let mut next = self.next_type();
            if next.is_none() && self.phase == Phase::Pre {
                self.phase = Phase::Post;
                self.cursor = 0;
                next = self.next_type();
            }
            self.waiting_on = next;

            match next {
                Some(rtype) => {
                    match self.phase {
                        Phase::Pre => self.session(rtype).push_pre(),
                        _ => self.session(rtype).push_post(),
                    }
                    self.track_ack(rtype);
                }
                None => {
                    self.finish_push();
                    match self.backlog.take() {
                        Some(update) => self.begin_push(Arc::new(update)),
                        None => return,
                    }
                }
            }
        }
    }

    fn finish_push(&mut self) {
        self.current = None;
        self.phase = Phase::Completed;
        self.cursor = 0;
        self.metrics.on_push_complete();
    }

    fn next_type(&mut self) -> Option<ResourceType> {
        let order = match self.phase {
            Phase::Pre => &self.add_order,
            _ => &self.remove_order,
        };
        let next = order.get(self.cursor).copied();
        self.cursor += 1;
        next
    }

    fn session(&mut self, rtype: ResourceType) -> &mut dyn TypeSession<R, S> {
        match &mut self.sessions[rtype] {
            Some(session) => session.as_mut(),
            None => panic!("no session for {rtype}"),
        }
    }

    fn assert_usable(&self) {
        assert!(self.initialized, "orchestrator used before init");
        assert!(!self.closed, "orchestrator used after close");
        assert_eq!(
            self.waiting_on.is_none(),
            self.current.is_none(),
            "a push must be waiting on a resource type"
        );
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use xds_api::pb::envoy::service::discovery::v3::DiscoveryRequest;

    use super::*;
    use crate::backlog::test::Steps;
    use crate::backlog::{FifoBacklog, MergingBacklog};
    use crate::metrics::NoopMetrics;
    use crate::xds::session::test::init_tracing;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Init(Steps),
        Update(Steps),
        Pre(ResourceType),
        Post(ResourceType),
        Request(ResourceType),
    }

    type Calls = Arc<Mutex<Vec<Call>>>;

    /// A session that pretends to send a message on every push and every
    /// request, and pretends every other request is an ack.
    struct FakeSession {
        rtype: ResourceType,
        calls: Calls,
        awaiting_ack: bool,
    }

    impl TypeSession<DiscoveryRequest, Steps> for FakeSession {
        fn resource_type(&self) -> ResourceType {
            self.rtype
        }

        fn process_request(&mut self, _: &DiscoveryRequest) -> Result<(), XdsError> {
            self.calls.lock().unwrap().push(Call::Request(self.rtype));
            self.awaiting_ack = !self.awaiting_ack;
            Ok(())
        }

        fn awaiting_ack(&self) -> bool {
            self.awaiting_ack
        }

        fn init(&mut self, state: Arc<Steps>) {
            self.calls.lock().unwrap().push(Call::Init((*state).clone()));
        }

        fn on_network_update(&mut self, update: Arc<Steps>) {
            self.calls.lock().unwrap().push(Call::Update((*update).clone()));
        }

        fn push_pre(&mut self) {
            self.calls.lock().unwrap().push(Call::Pre(self.rtype));
            self.awaiting_ack = true;
        }

        fn push_post(&mut self) {
            self.calls.lock().unwrap().push(Call::Post(self.rtype));
            self.awaiting_ack = true;
        }
    }

    /// A session for a type the client never asked for.
    struct SilentSession(ResourceType);

    impl TypeSession<DiscoveryRequest, Steps> for SilentSession {
        fn resource_type(&self) -> ResourceType {
            self.0
        }

        fn process_request(&mut self, _: &DiscoveryRequest) -> Result<(), XdsError> {
            Ok(())
        }

        fn awaiting_ack(&self) -> bool {
            false
        }

        fn init(&mut self, _: Arc<Steps>) {}

        fn on_network_update(&mut self, _: Arc<Steps>) {}

        fn push_pre(&mut self) {}

        fn push_post(&mut self) {}
    }

    fn steps(s: &[u32]) -> Steps {
        Steps(s.to_vec())
    }

    fn request(rtype: ResourceType) -> DiscoveryRequest {
        DiscoveryRequest {
            type_url: rtype.type_url().to_string(),
            ..Default::default()
        }
    }

    fn orchestrator(
        types: &[ResourceType],
        backlog: Box<dyn UpdateBacklog<Steps>>,
    ) -> (PushOrchestrator<DiscoveryRequest, Steps>, Calls) {
        init_tracing();
        let calls = Calls::default();
        let sessions = types
            .iter()
            .map(|rtype| {
                Box::new(FakeSession {
                    rtype: *rtype,
                    calls: calls.clone(),
                    awaiting_ack: false,
                }) as Box<dyn TypeSession<_, _>>
            })
            .collect();

        let mut remove_order = types.to_vec();
        remove_order.reverse();

        let orchestrator = PushOrchestrator::new(
            sessions,
            types,
            &remove_order,
            backlog,
            Box::new(NoopMetrics),
        );
        (orchestrator, calls)
    }

    fn fifo() -> Box<dyn UpdateBacklog<Steps>> {
        Box::new(FifoBacklog::<Steps>::default())
    }

    fn take(calls: &Calls) -> Vec<Call> {
        std::mem::take(&mut *calls.lock().unwrap())
    }

    #[test]
    fn test_single_session_push() {
        let (mut o, calls) = orchestrator(&[ResourceType::Cluster], fifo());

        o.init(steps(&[0]), None);
        assert_eq!(take(&calls), vec![Call::Init(steps(&[0]))]);

        o.push_update(steps(&[1]));
        assert_eq!(
            take(&calls),
            vec![Call::Update(steps(&[1])), Call::Pre(ResourceType::Cluster)]
        );
        assert!(o.is_pushing());

        // ack the PRE message
        o.process_update(&request(ResourceType::Cluster)).unwrap();
        assert_eq!(
            take(&calls),
            vec![
                Call::Request(ResourceType::Cluster),
                Call::Post(ResourceType::Cluster)
            ]
        );

        // ack the POST message
        o.process_update(&request(ResourceType::Cluster)).unwrap();
        assert_eq!(take(&calls), vec![Call::Request(ResourceType::Cluster)]);
        assert!(!o.is_pushing());
    }

    #[test]
    fn test_push_blocks_until_ack() {
        let (mut o, calls) = orchestrator(&[ResourceType::Cluster], fifo());
        o.init(steps(&[0]), None);

        o.push_update(steps(&[1]));
        take(&calls);

        // a second update waits for the first to finish
        o.push_update(steps(&[2]));
        assert!(take(&calls).is_empty());

        o.process_update(&request(ResourceType::Cluster)).unwrap();
        o.process_update(&request(ResourceType::Cluster)).unwrap();
        assert_eq!(
            take(&calls),
            vec![
                Call::Request(ResourceType::Cluster),
                Call::Post(ResourceType::Cluster),
                Call::Request(ResourceType::Cluster),
                Call::Update(steps(&[2])),
                Call::Pre(ResourceType::Cluster),
            ]
        );
    }

    #[test]
    fn test_multiple_sessions_make_before_break() {
        let (a, b) = (ResourceType::Cluster, ResourceType::Listener);
        let (mut o, calls) = orchestrator(&[a, b], fifo());
        o.init(steps(&[0]), None);

        o.push_update(steps(&[1]));
        // b hears about the update but gets nothing pushed until a is acked
        assert_eq!(
            take(&calls),
            vec![
                Call::Update(steps(&[1])),
                Call::Update(steps(&[1])),
                Call::Pre(a)
            ]
        );

        o.process_update(&request(a)).unwrap();
        assert_eq!(take(&calls), vec![Call::Request(a), Call::Pre(b)]);

        // removals go in reverse
        o.process_update(&request(b)).unwrap();
        assert_eq!(take(&calls), vec![Call::Request(b), Call::Post(b)]);

        o.process_update(&request(b)).unwrap();
        assert_eq!(take(&calls), vec![Call::Request(b), Call::Post(a)]);

        o.process_update(&request(a)).unwrap();
        assert_eq!(take(&calls), vec![Call::Request(a)]);
        assert!(!o.is_pushing());
    }

    #[test]
    fn test_sessions_with_nothing_to_send_are_skipped() {
        let calls = Calls::default();
        let sessions: Vec<Box<dyn TypeSession<DiscoveryRequest, Steps>>> = vec![
            Box::new(SilentSession(ResourceType::Secret)),
            Box::new(FakeSession {
                rtype: ResourceType::Cluster,
                calls: calls.clone(),
                awaiting_ack: false,
            }),
            Box::new(SilentSession(ResourceType::Listener)),
        ];
        let order = [ResourceType::Secret, ResourceType::Cluster, ResourceType::Listener];
        let mut o = PushOrchestrator::new(
            sessions,
            &order,
            &order,
            fifo(),
            Box::new(NoopMetrics),
        );
        o.init(steps(&[0]), None);

        o.push_update(steps(&[1]));
        assert_eq!(
            take(&calls),
            vec![Call::Update(steps(&[1])), Call::Pre(ResourceType::Cluster)]
        );

        o.process_update(&request(ResourceType::Cluster)).unwrap();
        assert_eq!(
            take(&calls),
            vec![
                Call::Request(ResourceType::Cluster),
                Call::Post(ResourceType::Cluster)
            ]
        );

        o.process_update(&request(ResourceType::Cluster)).unwrap();
        assert!(!o.is_pushing());
    }

    #[test]
    fn test_update_during_subscription_does_not_push() {
        let (mut o, calls) = orchestrator(&[ResourceType::Cluster], fifo());
        o.init(steps(&[0]), None);

        // the client subscribes and the response is outstanding
        o.process_update(&request(ResourceType::Cluster)).unwrap();
        take(&calls);

        o.push_update(steps(&[1]));
        assert!(take(&calls).is_empty());
        assert!(!o.is_pushing());

        // the ack releases the update
        o.process_update(&request(ResourceType::Cluster)).unwrap();
        assert_eq!(
            take(&calls),
            vec![
                Call::Request(ResourceType::Cluster),
                Call::Update(steps(&[1])),
                Call::Pre(ResourceType::Cluster)
            ]
        );
    }

    #[test]
    fn test_delay_until_ack() {
        let (rds, cds) = (ResourceType::RouteConfiguration, ResourceType::Cluster);
        let (mut o, calls) = orchestrator(&[cds, rds], fifo());
        o.init(steps(&[0]), Some(rds));

        // nothing goes out while waiting for routes, no matter how much changes
        o.push_update(steps(&[1]));
        o.push_update(steps(&[2]));
        assert!(take(&calls).is_empty());

        // subscribing to clusters and acking it doesn't help
        o.process_update(&request(cds)).unwrap();
        o.process_update(&request(cds)).unwrap();
        assert_eq!(take(&calls), vec![Call::Request(cds), Call::Request(cds)]);

        // sending routes doesn't help either
        o.process_update(&request(rds)).unwrap();
        assert_eq!(take(&calls), vec![Call::Request(rds)]);

        // the first routes ack starts pushing
        o.process_update(&request(rds)).unwrap();
        assert_eq!(
            take(&calls),
            vec![
                Call::Request(rds),
                Call::Update(steps(&[1])),
                Call::Update(steps(&[1])),
                Call::Pre(cds),
            ]
        );
    }

    #[test]
    fn test_merging_backlog_coalesces() {
        let merging = Box::new(MergingBacklog::<Steps>::default());
        let (mut o, calls) = orchestrator(&[ResourceType::Cluster], merging);
        o.init(steps(&[0]), None);

        o.push_update(steps(&[1]));
        o.push_update(steps(&[2]));
        o.push_update(steps(&[3]));
        o.push_update(steps(&[4]));
        take(&calls);

        o.process_update(&request(ResourceType::Cluster)).unwrap();
        o.process_update(&request(ResourceType::Cluster)).unwrap();
        assert_eq!(
            take(&calls),
            vec![
                Call::Request(ResourceType::Cluster),
                Call::Post(ResourceType::Cluster),
                Call::Request(ResourceType::Cluster),
                Call::Update(steps(&[2, 3, 4])),
                Call::Pre(ResourceType::Cluster),
            ]
        );
    }

    #[test]
    fn test_unknown_type_url() {
        let (mut o, _) = orchestrator(&[ResourceType::Cluster], fifo());
        o.init(steps(&[0]), None);

        let mut req = request(ResourceType::Cluster);
        req.type_url = "type.googleapis.com/potato".to_string();
        assert!(matches!(
            o.process_update(&req),
            Err(XdsError::ProtocolViolation(_))
        ));

        assert!(matches!(
            o.process_update(&request(ResourceType::Listener)),
            Err(XdsError::ProtocolViolation(_))
        ));
    }

    #[test]
    #[should_panic]
    fn test_push_before_init() {
        let (mut o, _) = orchestrator(&[ResourceType::Cluster], fifo());
        o.push_update(steps(&[1]));
    }

    #[test]
    #[should_panic]
    fn test_push_after_close() {
        let (mut o, _) = orchestrator(&[ResourceType::Cluster], fifo());
        o.init(steps(&[0]), None);
        o.close();
        o.push_update(steps(&[1]));
    }

    #[test]
    #[should_panic]
    fn test_double_init() {
        let (mut o, _) = orchestrator(&[ResourceType::Cluster], fifo());
        o.init(steps(&[0]), None);
        o.init(steps(&[0]), None);
    }
}
