use std::time::Instant;

use metrics::{describe_counter, describe_gauge, Counter, Gauge, Histogram, IntoF64};
use once_cell::sync::Lazy;

use crate::xds::Protocol;

/// Increments a gauge by the given amount, then decrements it when the returned
/// guard goes out of scope.
macro_rules! scoped_gauge {
    ($name:expr, $inc:expr $(, $label_key:expr => $label_value:expr)* $(,)?) => {{
        let g = ::metrics::gauge!($name $(, $label_key => $label_value)*);
        g.increment($inc as f64);
        crate::metrics::IncGuard::new(g, -($inc as f64))
    }};
}

/// Describe a timer. Shorthand for `describe_histogram!(name, Unit::Seconds,
/// description)` so you don't have to remember what units timers are in.
macro_rules! describe_timer {
    ($name:expr, $description:expr $(,)?) => {{
        ::metrics::describe_histogram!($name, ::metrics::Unit::Seconds, $description)
    }};
}

/// Hooks called as a client's pushes start, finish, and get acknowledged.
///
/// Hooks are called with the client's session lock held and should return
/// quickly.
pub trait SessionMetrics: Send {
    fn on_push_begin(&mut self) {}

    fn on_push_complete(&mut self) {}

    /// A resource type has sent a message that hasn't been acknowledged.
    fn on_awaiting_ack(&mut self) {}

    /// A resource type's outstanding message was acknowledged.
    fn on_message_acked(&mut self) {}

    fn close(&mut self) {}
}

/// Builds the [SessionMetrics] for each new client.
pub type MetricsFactory = dyn Fn(Protocol) -> Box<dyn SessionMetrics> + Send + Sync;

/// Metrics that go nowhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl SessionMetrics for NoopMetrics {}

/// [SessionMetrics] recorded with the `metrics` crate. Installing a recorder
/// and an exporter is up to the embedder.
pub struct XdsMetrics {
    pushes_started: Counter,
    pushes_completed: Counter,
    push_time: Histogram,
    acks_outstanding: Gauge,
    outstanding: u32,
    push_timer: Option<TimerGuard>,
    active: Option<IncGuard>,
}

impl XdsMetrics {
    pub fn new(protocol: Protocol) -> Self {
        Lazy::force(&DESCRIBED);
        let protocol = protocol.as_str();

        Self {
            pushes_started: metrics::counter!("xds.push.started", "protocol" => protocol),
            pushes_completed: metrics::counter!("xds.push.completed", "protocol" => protocol),
            push_time: metrics::histogram!("xds.push.time", "protocol" => protocol),
            acks_outstanding: metrics::gauge!("xds.acks.outstanding", "protocol" => protocol),
            outstanding: 0,
            push_timer: None,
            active: Some(scoped_gauge!("xds.sessions.active", 1, "protocol" => protocol)),
        }
    }

    pub fn factory() -> Box<MetricsFactory> {
        Box::new(|protocol| Box::new(XdsMetrics::new(protocol)))
    }
}

impl SessionMetrics for XdsMetrics {
    fn on_push_begin(&mut self) {
        self.pushes_started.increment(1);
        self.push_timer = Some(TimerGuard::new_at(self.push_time.clone(), Instant::now()));
    }

    fn on_push_complete(&mut self) {
        self.pushes_completed.increment(1);
        self.push_timer.take();
    }

    fn on_awaiting_ack(&mut self) {
        self.outstanding += 1;
        self.acks_outstanding.increment(1.0);
    }

    fn on_message_acked(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.acks_outstanding.decrement(1.0);
    }

    fn close(&mut self) {
        self.acks_outstanding.decrement(self.outstanding as f64);
        self.outstanding = 0;
        // an unfinished push isn't a push time
        if let Some(timer) = self.push_timer.take() {
            timer.cancel();
        }
        self.active.take();
    }
}

static DESCRIBED: Lazy<()> = Lazy::new(describe_metrics);

fn describe_metrics() {
    describe_counter!("xds.push.started", "The total number of pushes started");
    describe_counter!("xds.push.completed", "The total number of pushes completed");
    describe_timer!(
        "xds.push.time",
        "Time from the start of a push until every resource type has been acknowledged (seconds)",
    );
    describe_gauge!(
        "xds.acks.outstanding",
        "The number of resource types waiting for a client to acknowledge a response",
    );
    describe_gauge!(
        "xds.sessions.active",
        "The number of currently active client sessions",
    );
}

/// An RAII guard that decrements a gauge on drop.
///
/// Created with [scoped_gauge].
pub(crate) struct IncGuard {
    gauge: Gauge,
    value: f64,
}

impl IncGuard {
    pub(crate) fn new<T: IntoF64>(gauge: Gauge, value: T) -> Self {
        let value = value.into_f64();
        Self { gauge, value }
    }
}

impl Drop for IncGuard {
    fn drop(&mut self) {
        self.gauge.increment(self.value);
    }
}

/// An RAII timer guard that records its duration on drop.
pub(crate) struct TimerGuard {
    hist: Histogram,
    started_at: Option<Instant>,
}

impl TimerGuard {
    pub(crate) fn new_at(hist: Histogram, started_at: Instant) -> Self {
        Self {
            hist,
            started_at: Some(started_at),
        }
    }

    /// Drop the timer without recording anything.
    pub(crate) fn cancel(mut self) {
        self.started_at = None;
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if let Some(started_at) = self.started_at {
            self.hist.record(started_at.elapsed().as_secs_f64());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // without a recorder installed every metric is a no-op, this just checks
    // the bookkeeping.
    #[test]
    fn test_outstanding_acks() {
        let mut metrics = XdsMetrics::new(Protocol::Sotw);

        metrics.on_push_begin();
        metrics.on_awaiting_ack();
        metrics.on_awaiting_ack();
        metrics.on_message_acked();
        assert_eq!(metrics.outstanding, 1);
        assert!(metrics.push_timer.is_some());

        metrics.on_push_complete();
        assert!(metrics.push_timer.is_none());

        metrics.close();
        assert_eq!(metrics.outstanding, 0);
        assert!(metrics.active.is_none());
    }
}
