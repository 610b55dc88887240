//! Network updates waiting for an in-flight push to finish.

use std::collections::VecDeque;

use crate::api::Mergeable;

/// Holds the network updates that arrive while a push is in flight.
pub trait UpdateBacklog<S>: Send {
    fn is_empty(&self) -> bool;

    fn put(&mut self, update: S);

    fn take(&mut self) -> Option<S>;
}

/// Builds a fresh [UpdateBacklog] for each client.
pub trait BacklogFactory<S>: Send + Sync {
    fn build(&self) -> Box<dyn UpdateBacklog<S>>;
}

/// A backlog with a single slot. Every update put into a full backlog is
/// merged into the slot, so a slow client only ever sees the latest state.
pub struct MergingBacklog<S> {
    pending: Option<S>,
}

impl<S> Default for MergingBacklog<S> {
    fn default() -> Self {
        Self { pending: None }
    }
}

impl<S: Mergeable + Send + 'static> MergingBacklog<S> {
    pub fn factory() -> impl BacklogFactory<S> {
        MergingBacklogFactory
    }
}

impl<S: Mergeable + Send> UpdateBacklog<S> for MergingBacklog<S> {
    fn is_empty(&self) -> bool {
        self.pending.is_none()
    }

    fn put(&mut self, update: S) {
        self.pending = Some(match self.pending.take() {
            Some(pending) => pending.merge(update),
            None => update,
        });
    }

    fn take(&mut self) -> Option<S> {
        self.pending.take()
    }
}

struct MergingBacklogFactory;

impl<S: Mergeable + Send + 'static> BacklogFactory<S> for MergingBacklogFactory {
    fn build(&self) -> Box<dyn UpdateBacklog<S>> {
        Box::new(MergingBacklog::default())
    }
}

/// An unbounded queue of updates. Every update gets its own push, which makes
/// behavior easy to predict in tests and expensive under churn.
pub struct FifoBacklog<S> {
    pending: VecDeque<S>,
}

impl<S> Default for FifoBacklog<S> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }
}

impl<S: Send + 'static> FifoBacklog<S> {
    pub fn factory() -> impl BacklogFactory<S> {
        FifoBacklogFactory
    }
}

impl<S: Send> UpdateBacklog<S> for FifoBacklog<S> {
    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn put(&mut self, update: S) {
        self.pending.push_back(update);
    }

    fn take(&mut self) -> Option<S> {
        self.pending.pop_front()
    }
}

struct FifoBacklogFactory;

impl<S: Send + 'static> BacklogFactory<S> for FifoBacklogFactory {
    fn build(&self) -> Box<dyn UpdateBacklog<S>> {
        Box::new(FifoBacklog::default())
    }
}
