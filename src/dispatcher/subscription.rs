//! Subscriber-side handle: filter, notifications and the receive loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::Stream;
use futures::stream;
use tokio::sync::mpsc;

use super::Shared;
use crate::event::ChangeEvent;
use crate::model::{JobId, Sequence, SessionId};

/// Opaque subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(super) u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Which events a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    All,
    /// Every job belonging to one chat session.
    Session(SessionId),
    /// An explicit set of job ids.
    Jobs(HashSet<JobId>),
}

impl SubscriptionFilter {
    pub fn jobs(ids: impl IntoIterator<Item = JobId>) -> Self {
        Self::Jobs(ids.into_iter().collect())
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Session(s) => event.session_id == *s,
            SubscriptionFilter::Jobs(ids) => ids.contains(&event.job_id),
        }
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Event(ChangeEvent),
    /// The dispatcher lost its change feed and is reconnecting.
    Reconnecting,
    /// Feed restored. Anything missed in between has already been replayed.
    Reconnected,
    /// Delivery was interrupted (slow consumer, or the replay window could
    /// not cover the resume point). The subscriber must reconcile from a full
    /// listing, then resubscribe from `cursor`. This is the last notification
    /// on the handle.
    Resync { cursor: Sequence },
}

/// Flags shared between the dispatcher's slot and the handle.
#[derive(Debug, Default)]
pub(super) struct SlotState {
    pub(super) closed: AtomicBool,
    pub(super) lagged: AtomicBool,
    pub(super) resync_at: AtomicU64,
}

impl SlotState {
    pub(super) fn mark_lagged(&self, at: Sequence) {
        self.resync_at.store(at.0, Ordering::SeqCst);
        self.lagged.store(true, Ordering::SeqCst);
    }
}

/// A live registration with the dispatcher.
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    pub(super) id: SubscriptionId,
    pub(super) rx: mpsc::Receiver<Notification>,
    pub(super) state: Arc<SlotState>,
    pub(super) dispatcher: Weak<Shared>,
    pub(super) cursor: Sequence,
    pub(super) finished: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Sequence of the last event delivered (or the starting cursor).
    pub fn cursor(&self) -> Sequence {
        self.cursor
    }

    /// Next notification, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Notification> {
        if self.finished {
            return None;
        }
        loop {
            if self.state.closed.load(Ordering::SeqCst) {
                self.finished = true;
                return None;
            }
            match self.rx.recv().await {
                Some(_) if self.state.closed.load(Ordering::SeqCst) => continue,
                Some(Notification::Event(event)) => {
                    // replay and live can meet at the boundary
                    if event.sequence <= self.cursor {
                        continue;
                    }
                    self.cursor = event.sequence;
                    return Some(Notification::Event(event));
                }
                Some(resync @ Notification::Resync { .. }) => {
                    self.finished = true;
                    return Some(resync);
                }
                Some(other) => return Some(other),
                None => {
                    self.finished = true;
                    if self.state.lagged.load(Ordering::SeqCst)
                        && !self.state.closed.load(Ordering::SeqCst)
                    {
                        let cursor = Sequence(self.state.resync_at.load(Ordering::SeqCst));
                        return Some(Notification::Resync { cursor });
                    }
                    return None;
                }
            }
        }
    }

    /// Stop delivery. Idempotent; nothing is yielded afterwards.
    pub fn unsubscribe(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.finished = true;
        if let Some(shared) = self.dispatcher.upgrade() {
            shared.remove_slot(self.id);
        }
        self.rx.close();
    }

    /// Lazy stream view of the same notifications.
    pub fn into_stream(self) -> impl Stream<Item = Notification> + Send + 'static {
        stream::unfold(self, |mut sub| async move {
            let next = sub.next().await?;
            Some((next, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("cursor", &self.cursor)
            .field("finished", &self.finished)
            .finish()
    }
}
