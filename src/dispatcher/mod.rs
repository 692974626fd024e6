//! Notification dispatcher: one change feed in, many filtered subscribers out.
//!
//! A single task reads the store's change feed in sequence order and fans
//! each event out to every matching subscriber with a non-blocking
//! `try_send`. A subscriber whose buffer is full is dropped and told to
//! resync; nobody else waits on it. The last `replay_capacity` events stay in
//! a ring so a resuming subscriber is usually served without touching the
//! store. When the feed drops, the task reconnects from its head with
//! exponential backoff and replays what it missed.

mod subscription;

pub use subscription::{Notification, Subscription, SubscriptionFilter, SubscriptionId};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use futures::stream::BoxStream;
use opentelemetry::KeyValue;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::{Error, Result};
use crate::event::ChangeEvent;
use crate::model::Sequence;
use crate::retry::{RetryPolicy, with_retry};
use crate::store::JobStore;
use crate::telemetry::metrics;
use subscription::SlotState;

/// Attempts to line up a store backlog with the ring before giving up and
/// sending the subscriber a resync.
const REPLAY_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-subscriber buffer. A subscriber that falls this far behind is
    /// disconnected with a resync signal.
    pub subscriber_buffer: usize,
    /// Recent events kept in memory for resuming subscribers.
    pub replay_capacity: usize,
    /// Backoff for feed reconnects (retried forever) and backlog fetches.
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            replay_capacity: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

struct Slot {
    filter: SubscriptionFilter,
    tx: mpsc::Sender<Notification>,
    state: Arc<SlotState>,
}

struct FanOut {
    /// Sequence of the last event fanned out.
    head: Sequence,
    /// The ring holds every event with sequence > floor.
    floor: Sequence,
    ring: VecDeque<ChangeEvent>,
    slots: HashMap<SubscriptionId, Slot>,
    connected: bool,
}

pub(crate) struct Shared {
    store: Arc<dyn JobStore>,
    config: DispatcherConfig,
    fanout: Mutex<FanOut>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FanOut> {
        self.fanout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn remove_slot(&self, id: SubscriptionId) {
        if let Some(slot) = self.lock().slots.remove(&id) {
            slot.state.closed.store(true, Ordering::SeqCst);
            debug!(subscription = %id, "unsubscribed");
        }
    }

    fn fan_out(&self, event: ChangeEvent) {
        let mut guard = self.lock();
        let fan = &mut *guard;
        if event.sequence <= fan.head {
            return;
        }
        fan.head = event.sequence;
        fan.ring.push_back(event.clone());
        while fan.ring.len() > self.config.replay_capacity {
            if let Some(evicted) = fan.ring.pop_front() {
                fan.floor = evicted.sequence;
            }
        }

        let head = fan.head;
        fan.slots.retain(|id, slot| {
            if !slot.filter.matches(&event) {
                return true;
            }
            deliver(*id, slot, Notification::Event(event.clone()), head, "live")
        });
    }

    fn signal(&self, notification: Notification) {
        let mut guard = self.lock();
        let fan = &mut *guard;
        let head = fan.head;
        fan.slots
            .retain(|id, slot| deliver(*id, slot, notification.clone(), head, "signal"));
    }

    fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    fn close_all(&self) {
        let mut fan = self.lock();
        let count = fan.slots.len();
        fan.slots.clear();
        info!(count, "closed all subscriptions");
    }

    /// Reopen the feed from our head, backing off until it works or we are
    /// shut down.
    async fn reconnect(&self) -> Option<BoxStream<'static, ChangeEvent>> {
        self.set_connected(false);
        self.signal(Notification::Reconnecting);
        warn!(head = %self.lock().head, "change feed lost, reconnecting");

        let policy = self.config.retry.clone().forever();
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            let delay = policy.delay_for_attempt(attempt);
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let head = self.lock().head;
            match self.store.change_feed(Some(head)).await {
                Ok(feed) => {
                    metrics::feed_reconnects().add(1, &[KeyValue::new("result", "ok")]);
                    let replayed = feed.backlog.len();
                    for event in feed.backlog {
                        self.fan_out(event);
                    }
                    self.set_connected(true);
                    self.signal(Notification::Reconnected);
                    info!(attempt, %head, replayed, "change feed restored");
                    return Some(feed.live);
                }
                Err(e) => {
                    metrics::feed_reconnects().add(1, &[KeyValue::new("result", "error")]);
                    warn!(attempt, error = %e, "change feed reconnect failed");
                }
            }
        }
    }
}

/// Push without blocking. Returns false when the slot must be dropped.
fn deliver(
    id: SubscriptionId,
    slot: &Slot,
    notification: Notification,
    head: Sequence,
    kind: &'static str,
) -> bool {
    match slot.tx.try_send(notification) {
        Ok(()) => {
            metrics::dispatcher_deliveries().add(1, &[KeyValue::new("kind", kind)]);
            true
        }
        Err(TrySendError::Full(_)) => {
            slot.state.mark_lagged(head);
            metrics::slow_consumer_drops().add(1, &[]);
            warn!(subscription = %id, %head, "subscriber buffer full, dropping slow consumer");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

async fn run(shared: Arc<Shared>, mut live: BoxStream<'static, ChangeEvent>) {
    info!(head = %shared.lock().head, "dispatcher started");
    loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = live.next() => next,
        };
        match next {
            Some(event) => shared.fan_out(event),
            None => match shared.reconnect().await {
                Some(restored) => live = restored,
                None => break,
            },
        }
    }
    shared.close_all();
    info!("dispatcher stopped");
}

/// Handle to the running dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Connect to the store's change feed and start fanning out.
    pub async fn start(store: Arc<dyn JobStore>, config: DispatcherConfig) -> Result<Self> {
        let feed = with_retry(&config.retry, "dispatcher.connect", || {
            store.change_feed(None)
        })
        .await?;

        let shared = Arc::new(Shared {
            store,
            config,
            fanout: Mutex::new(FanOut {
                head: feed.head,
                floor: feed.head,
                ring: VecDeque::new(),
                slots: HashMap::new(),
                connected: true,
            }),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(
            run(Arc::clone(&shared), feed.live).instrument(info_span!("dispatcher")),
        );
        *shared.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        Ok(Self { shared })
    }

    /// Register a subscriber. Returns once its starting cursor is fixed.
    ///
    /// With `resume = Some(c)` every matching event with sequence > c is
    /// replayed before live delivery begins; with `None` delivery starts at
    /// the current head.
    pub async fn subscribe(
        &self,
        filter: SubscriptionFilter,
        resume: Option<Sequence>,
    ) -> Result<Subscription> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::Other("dispatcher is shut down".to_string()));
        }

        let mut backlog: Option<Vec<ChangeEvent>> = None;
        for _ in 0..REPLAY_ATTEMPTS {
            let cursor = {
                let mut fan = self.shared.lock();
                let cursor = resume.unwrap_or(fan.head);
                if covers(&fan, cursor, backlog.as_deref()) {
                    return Ok(self.register(&mut fan, filter, cursor, backlog.as_deref()));
                }
                cursor
            };
            let store = &self.shared.store;
            backlog = Some(
                with_retry(&self.shared.config.retry, "dispatcher.replay", || {
                    store.replay(cursor)
                })
                .await?,
            );
        }

        // the ring keeps outrunning the store backlog
        let mut fan = self.shared.lock();
        let cursor = resume.unwrap_or(fan.head);
        Ok(self.resync_now(&mut fan, cursor))
    }

    /// Idempotent. Pending deliveries for the handle are discarded.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.remove_slot(id);
    }

    /// Sequence of the last event fanned out.
    pub fn head(&self) -> Sequence {
        self.shared.lock().head
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().slots.len()
    }

    /// Stop the fan-out task and end every subscription.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let task = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("dispatcher task ended abnormally: {e}");
            }
        }
    }

    fn register(
        &self,
        fan: &mut FanOut,
        filter: SubscriptionFilter,
        cursor: Sequence,
        backlog: Option<&[ChangeEvent]>,
    ) -> Subscription {
        let floor = fan.floor;
        let replay: Vec<&ChangeEvent> = backlog
            .unwrap_or_default()
            .iter()
            .filter(|e| e.sequence <= floor)
            .chain(fan.ring.iter())
            .filter(|e| e.sequence > cursor && filter.matches(e))
            .collect();

        if replay.len() > self.shared.config.replay_capacity {
            debug!(%cursor, pending = replay.len(), "replay too large, asking for resync");
            return self.resync_now(fan, cursor);
        }

        // room for the replay, a link signal and the live buffer
        let capacity = self.shared.config.subscriber_buffer.max(1) + replay.len() + 1;
        let (tx, rx) = mpsc::channel(capacity);
        for event in &replay {
            if tx.try_send(Notification::Event((*event).clone())).is_ok() {
                metrics::dispatcher_deliveries().add(1, &[KeyValue::new("kind", "replay")]);
            }
        }
        if !fan.connected {
            let _ = tx.try_send(Notification::Reconnecting);
        }

        let id = self.next_id();
        let state = Arc::new(SlotState::default());
        fan.slots.insert(
            id,
            Slot {
                filter,
                tx,
                state: Arc::clone(&state),
            },
        );
        debug!(subscription = %id, %cursor, replayed = replay.len(), "subscribed");

        Subscription {
            id,
            rx,
            state,
            dispatcher: Arc::downgrade(&self.shared),
            cursor,
            finished: false,
        }
    }

    /// A handle whose only notification is `Resync` at the current head.
    fn resync_now(&self, fan: &mut FanOut, cursor: Sequence) -> Subscription {
        let (_tx, rx) = mpsc::channel(1);
        let state = Arc::new(SlotState::default());
        state.mark_lagged(fan.head);
        Subscription {
            id: self.next_id(),
            rx,
            state,
            dispatcher: Arc::downgrade(&self.shared),
            cursor,
            finished: false,
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Can events after `cursor` be served from the ring, possibly topped up by
/// a store backlog?
fn covers(fan: &FanOut, cursor: Sequence, backlog: Option<&[ChangeEvent]>) -> bool {
    if cursor >= fan.floor {
        return true;
    }
    match backlog {
        Some(events) => events.last().map(|e| e.sequence).unwrap_or(cursor) >= fan.floor,
        None => false,
    }
}
