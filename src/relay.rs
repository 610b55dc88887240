//! Hand network updates to a client off the thread that produced them.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::api::{Mergeable, NetworkListener};

/// How a [QueueingRelay] handles updates that pile up while its downstream
/// listener is busy.
pub enum RelayStrategy<S> {
    /// Deliver every update, in order.
    Fifo,

    /// Fold everything that's queued into a single update before delivering
    /// it.
    Merging(fn(S, S) -> S),
}

impl<S: Mergeable> RelayStrategy<S> {
    pub fn merging() -> Self {
        Self::Merging(S::merge)
    }
}

impl<S> Clone for RelayStrategy<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Fifo => Self::Fifo,
            Self::Merging(merge) => Self::Merging(*merge),
        }
    }
}

/// A [NetworkListener] that queues updates and delivers them to another
/// listener from a background task.
///
/// Closing the relay stops it accepting updates. Anything already queued is
/// still delivered before the downstream listener is closed.
pub struct QueueingRelay<S> {
    tx: Mutex<Option<mpsc::UnboundedSender<S>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + 'static> QueueingRelay<S> {
    /// Start a relay in front of `delegate`. Must be called from inside a
    /// tokio runtime.
    pub fn spawn(strategy: RelayStrategy<S>, delegate: Arc<dyn NetworkListener<S>>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(relay(rx, strategy, delegate));

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Wait for the relay's background task to exit. Returns immediately if
    /// something else is already waiting.
    pub async fn finished(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!(err = %e, "relay task did not exit cleanly");
            }
        }
    }
}

impl<S: Send + 'static> NetworkListener<S> for QueueingRelay<S> {
    fn on_network_change(&self, update: S) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(update).is_err() {
                    trace!("relay stopped, dropping update");
                }
            }
            None => trace!("relay closed, dropping update"),
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

async fn relay<S>(
    mut rx: mpsc::UnboundedReceiver<S>,
    strategy: RelayStrategy<S>,
    delegate: Arc<dyn NetworkListener<S>>,
) {
    while let Some(mut update) = rx.recv().await {
        if let RelayStrategy::Merging(merge) = &strategy {
            while let Ok(next) = rx.try_recv() {
                update = merge(update, next);
            }
        }

        let delivered =
            std::panic::catch_unwind(AssertUnwindSafe(|| delegate.on_network_change(update)));
        if let Err(panic) = delivered {
            let reason = panic_message(panic.as_ref());
            error!(%reason, "network listener panicked, no more updates will be delivered");

            let error = anyhow::anyhow!("network listener panicked: {reason}");
            if std::panic::catch_unwind(AssertUnwindSafe(|| delegate.on_error(error))).is_err() {
                error!("network listener panicked while handling an error");
            }
            break;
        }
    }

    rx.close();
    if std::panic::catch_unwind(AssertUnwindSafe(|| delegate.close())).is_err() {
        error!("network listener panicked while closing");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return s;
    }
    match panic.downcast_ref::<String>() {
        Some(s) => s.as_str(),
        None => "unknown panic",
    }
}
