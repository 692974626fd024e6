//! One chat session's reconciler.
//!
//! All view mutation happens on a single actor task fed by one command
//! queue: local submissions, dispatcher notifications, submit results and
//! the periodic full reconciliation. Readers go through the same queue, so
//! they always see a state the actor produced.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::view::{Change, EntryStatus, View, ViewEntry, ViewUpdate};
use crate::dispatcher::{Dispatcher, Notification, Subscription, SubscriptionFilter};
use crate::error::{Error, Result};
use crate::event::ChangeEvent;
use crate::machine::JobMachine;
use crate::model::{Job, JobFilter, JobId, NewJob, Sequence, SessionId, validate_input};
use crate::retry::RetryPolicy;
use crate::telemetry::metrics;

const UPDATE_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an optimistic entry may stay unconfirmed before it is
    /// shown as stale.
    pub optimistic_timeout: Duration,
    /// Full reconciliation period; the polling fallback under push delivery.
    pub reconcile_interval: Duration,
    /// Backoff for resubscribing to the dispatcher.
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            optimistic_timeout: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Delivery health as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Live,
    /// Dispatcher lost its feed; updates paused.
    Reconnecting,
    /// Catching up from a full listing after a delivery gap.
    Resyncing,
    /// Store unreachable; the UI shows "temporarily unavailable".
    Unavailable,
}

enum Command {
    InsertOptimistic { id: JobId, input: String },
    Submitted(Box<Job>),
    SubmitFailed { id: JobId, error: String },
    Event(Box<ChangeEvent>),
    Reconcile(Vec<Job>),
    Expire,
    Snapshot(oneshot::Sender<Vec<ViewEntry>>),
    Entry(JobId, oneshot::Sender<Option<ViewEntry>>),
}

/// Per-session reconciler handle. Dropping it stops the session.
pub struct Session {
    id: SessionId,
    machine: JobMachine,
    commands: mpsc::UnboundedSender<Command>,
    updates: broadcast::Sender<ViewUpdate>,
    status_tx: Arc<watch::Sender<LinkStatus>>,
    status: watch::Receiver<LinkStatus>,
    cancel: CancellationToken,
}

impl Session {
    /// Subscribe to the session's jobs, load the current listing and start
    /// the delivery and reconciliation tasks.
    pub async fn open(
        id: SessionId,
        machine: JobMachine,
        dispatcher: Dispatcher,
        config: SessionConfig,
    ) -> Result<Self> {
        // subscribe before listing so nothing falls between the two
        let subscription = dispatcher
            .subscribe(SubscriptionFilter::Session(id), None)
            .await?;

        let (commands, rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let (status_tx, status) = watch::channel(LinkStatus::Live);
        let status_tx = Arc::new(status_tx);
        let cancel = CancellationToken::new();
        let span = info_span!("session", session.id = %id);

        let view = View::new(config.optimistic_timeout);
        tokio::spawn(
            run_actor(view, rx, updates.clone(), cancel.clone()).instrument(span.clone()),
        );

        let session = Self {
            id,
            machine: machine.clone(),
            commands: commands.clone(),
            updates,
            status_tx: Arc::clone(&status_tx),
            status,
            cancel: cancel.clone(),
        };

        if let Err(e) = session.reconcile_now().await {
            warn!(session.id = %id, error = %e, "initial reconciliation failed");
        }

        let links = Links {
            session: id,
            machine,
            commands,
            status: status_tx,
            cancel,
        };
        tokio::spawn(
            links
                .clone()
                .pump(dispatcher, subscription, config.retry.clone())
                .instrument(span.clone()),
        );
        tokio::spawn(links.tick(config).instrument(span));

        info!(session.id = %id, "session opened");
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Show the query immediately and submit it in the background.
    ///
    /// Returns the id that will also name the store record and every event
    /// for it. Validation errors surface here; store trouble only ever shows
    /// up as the entry going stale.
    pub fn submit_local(&self, input: impl Into<String>) -> Result<JobId> {
        let input = input.into();
        validate_input(&input)?;

        let id = JobId::new();
        self.send(Command::InsertOptimistic {
            id,
            input: input.clone(),
        })?;

        let machine = self.machine.clone();
        let commands = self.commands.clone();
        let new = NewJob {
            id,
            session_id: self.id,
            input,
        };
        tokio::spawn(
            async move {
                let command = match machine.submit(new).await {
                    Ok(job) => Command::Submitted(Box::new(job)),
                    Err(e) => {
                        warn!(job.id = %id, error = %e, "submission failed");
                        Command::SubmitFailed {
                            id,
                            error: e.to_string(),
                        }
                    }
                };
                let _ = commands.send(command);
            }
            .in_current_span(),
        );

        Ok(id)
    }

    /// Current view, ordered by creation time.
    pub async fn view(&self) -> Result<Vec<ViewEntry>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| closed())
    }

    pub async fn entry(&self, id: JobId) -> Result<Option<ViewEntry>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Entry(id, tx))?;
        rx.await.map_err(|_| closed())
    }

    /// View changes as they are applied.
    ///
    /// A receiver that falls behind gets `RecvError::Lagged` and has missed
    /// updates; re-read [`Session::view`] or [`Session::entry`] before
    /// continuing, as [`Session::wait_for`] does.
    pub fn updates(&self) -> broadcast::Receiver<ViewUpdate> {
        self.updates.subscribe()
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Fetch the full listing now and merge it.
    pub async fn reconcile_now(&self) -> Result<()> {
        reconcile(self.id, &self.machine, &self.commands, &self.status_tx).await
    }

    /// Wait until the entry reaches a terminal state.
    ///
    /// A stale entry ends the wait with `StaleOptimisticEntry`; a later
    /// reconciliation may still confirm it.
    pub async fn wait_for(&self, id: JobId) -> Result<ViewEntry> {
        let mut updates = self.updates();
        loop {
            match self.entry(id).await? {
                Some(entry) if entry.status.is_terminal() => return Ok(entry),
                Some(entry) if entry.status == EntryStatus::Stale => {
                    return Err(Error::StaleOptimisticEntry(id));
                }
                None => return Err(Error::NotFound(id)),
                Some(_) => {}
            }
            loop {
                match updates.recv().await {
                    Ok(update) if update.entry.id == id => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(closed()),
                }
            }
        }
    }

    /// Stop all session tasks and release the subscription.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            info!(session.id = %self.id, "session closed");
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| closed())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed() -> Error {
    Error::Other("session closed".to_string())
}

async fn reconcile(
    session: SessionId,
    machine: &JobMachine,
    commands: &mpsc::UnboundedSender<Command>,
    status: &watch::Sender<LinkStatus>,
) -> Result<()> {
    match machine.list(&JobFilter::session(session)).await {
        Ok(jobs) => {
            debug!(jobs = jobs.len(), "full reconciliation");
            commands.send(Command::Reconcile(jobs)).map_err(|_| closed())?;
            status.send_if_modified(|s| {
                let recovered = matches!(*s, LinkStatus::Unavailable | LinkStatus::Resyncing);
                if recovered {
                    *s = LinkStatus::Live;
                }
                recovered
            });
            Ok(())
        }
        Err(e) => {
            if e.is_transient() {
                status.send_replace(LinkStatus::Unavailable);
            }
            Err(e)
        }
    }
}

async fn run_actor(
    mut view: View,
    mut rx: mpsc::UnboundedReceiver<Command>,
    updates: broadcast::Sender<ViewUpdate>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(c) => c,
                None => break,
            },
        };

        let changes: Vec<ViewUpdate> = match command {
            Command::InsertOptimistic { id, input } => {
                view.insert_optimistic(id, input, Utc::now()).into_iter().collect()
            }
            Command::Submitted(job) => view.apply_snapshot(&job).into_iter().collect(),
            Command::SubmitFailed { id, error } => {
                debug!(job.id = %id, %error, "optimistic entry abandoned");
                view.mark_stale(id).into_iter().collect()
            }
            Command::Event(event) => view.apply_event(&event).into_iter().collect(),
            Command::Reconcile(jobs) => view.reconcile_full(&jobs, Utc::now()),
            Command::Expire => view.expire_optimistic(Utc::now()),
            Command::Snapshot(reply) => {
                let _ = reply.send(view.entries());
                continue;
            }
            Command::Entry(id, reply) => {
                let _ = reply.send(view.get(id).cloned());
                continue;
            }
        };

        for update in changes {
            if update.change == Change::Stale {
                metrics::stale_optimistic_entries().add(1, &[]);
                warn!(job.id = %update.entry.id, "optimistic entry never confirmed");
            }
            debug!(job.id = %update.entry.id, status = %update.entry.status, "view updated");
            // no listeners is fine
            let _ = updates.send(update);
        }
    }
    debug!("session actor stopped");
}

/// What the delivery and timer tasks share.
#[derive(Clone)]
struct Links {
    session: SessionId,
    machine: JobMachine,
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<watch::Sender<LinkStatus>>,
    cancel: CancellationToken,
}

impl Links {
    /// Forward dispatcher notifications into the actor, resyncing and
    /// resubscribing whenever delivery is interrupted.
    async fn pump(self, dispatcher: Dispatcher, first: Subscription, retry: RetryPolicy) {
        let mut subscription = Some(first);
        let mut resume: Option<Sequence> = None;
        let mut attempt = 0u32;

        loop {
            let mut sub = match subscription.take() {
                Some(sub) => sub,
                None => {
                    let subscribed = tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        s = dispatcher.subscribe(
                            SubscriptionFilter::Session(self.session),
                            resume,
                        ) => s,
                    };
                    match subscribed {
                        Ok(sub) => {
                            attempt = 0;
                            sub
                        }
                        Err(e) => {
                            attempt = attempt.saturating_add(1);
                            if !retry.should_retry(attempt) {
                                warn!(error = %e, "giving up on dispatcher subscription");
                                self.status.send_replace(LinkStatus::Unavailable);
                                return;
                            }
                            warn!(attempt, error = %e, "resubscribe failed");
                            tokio::select! {
                                _ = self.cancel.cancelled() => return,
                                _ = tokio::time::sleep(retry.delay_for_attempt(attempt)) => {}
                            }
                            continue;
                        }
                    }
                }
            };

            loop {
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    n = sub.next() => n,
                };
                match next {
                    Some(Notification::Event(event)) => {
                        if self.commands.send(Command::Event(Box::new(event))).is_err() {
                            return;
                        }
                    }
                    Some(Notification::Reconnecting) => {
                        self.status.send_replace(LinkStatus::Reconnecting);
                    }
                    Some(Notification::Reconnected) => {
                        self.status.send_replace(LinkStatus::Live);
                    }
                    Some(Notification::Resync { cursor }) => {
                        info!(%cursor, "delivery interrupted, resyncing");
                        self.status.send_replace(LinkStatus::Resyncing);
                        if let Err(e) =
                            reconcile(self.session, &self.machine, &self.commands, &self.status)
                                .await
                        {
                            warn!(error = %e, "resync listing failed, timer will retry");
                        }
                        resume = Some(cursor);
                        break;
                    }
                    None => {
                        // dispatcher stopped
                        debug!("subscription ended");
                        return;
                    }
                }
            }
        }
    }

    /// Periodic full reconciliation plus the optimistic-timeout sweep.
    async fn tick(self, config: SessionConfig) {
        let mut reconcile_every =
            tokio::time::interval(config.reconcile_interval.max(MIN_PERIOD));
        let mut expire_every = tokio::time::interval(sweep_period(config.optimistic_timeout));
        // both fire immediately; the initial listing already ran
        reconcile_every.tick().await;
        expire_every.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = reconcile_every.tick() => {
                    if let Err(e) =
                        reconcile(self.session, &self.machine, &self.commands, &self.status).await
                    {
                        warn!(error = %e, "periodic reconciliation failed");
                    }
                }
                _ = expire_every.tick() => {
                    if self.commands.send(Command::Expire).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// `tokio::time::interval` panics on a zero period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

fn sweep_period(timeout: Duration) -> Duration {
    (timeout / 4).max(Duration::from_millis(10))
}
