//! Worker adapter and the runner loop that drives it.
//!
//! A [`Worker`] only turns a question into an answer. The [`Runner`] claims
//! pending jobs through the state machine, hands them to the worker and
//! records the outcome, so the worker never touches the store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::dispatcher::{Dispatcher, Notification, Subscription, SubscriptionFilter};
use crate::error::{Error, Result};
use crate::machine::JobMachine;
use crate::model::{Job, JobFilter, JobId, JobState};
use crate::telemetry::job::{record_outcome, record_state_transition, start_job_span};
use crate::telemetry::metrics;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Computes the answer for one job.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// Produce the answer, or an error that marks the job failed.
    async fn process(&self, id: JobId, input: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Poll fallback when no notification arrives.
    pub poll_interval: Duration,
    /// Jobs executing at once.
    pub max_concurrent: usize,
    /// How often timed-out claims are swept back to pending.
    pub reclaim_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_concurrent: 4,
            reclaim_interval: Duration::from_secs(60),
        }
    }
}

/// The runner loop: wait for pending work, claim it, execute, retire.
pub struct Runner {
    machine: JobMachine,
    dispatcher: Option<Dispatcher>,
    worker: Arc<dyn Worker>,
    config: RunnerConfig,
    shutdown: Arc<Notify>,
    active: Arc<AtomicUsize>,
}

impl Clone for Runner {
    fn clone(&self) -> Self {
        Self {
            machine: self.machine.clone(),
            dispatcher: self.dispatcher.clone(),
            worker: Arc::clone(&self.worker),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            active: Arc::clone(&self.active),
        }
    }
}

impl Runner {
    pub fn new(machine: JobMachine, worker: Arc<dyn Worker>, config: RunnerConfig) -> Self {
        Self {
            machine,
            dispatcher: None,
            worker,
            config,
            shutdown: Arc::new(Notify::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wake on `pending` events instead of waiting for the next poll.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Signal the runner to shut down.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Jobs currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Run until shutdown, then wait for in-flight jobs to finish.
    pub async fn run(&self) -> Result<()> {
        let mut subscription = match &self.dispatcher {
            Some(d) => Some(d.subscribe(SubscriptionFilter::All, None).await?),
            None => None,
        };
        // tokio panics on a zero period
        let mut poll = tokio::time::interval(self.config.poll_interval.max(MIN_PERIOD));
        let mut sweep = tokio::time::interval(self.config.reclaim_interval.max(MIN_PERIOD));
        let mut tasks = JoinSet::new();

        info!(worker = self.worker.name(), "runner started");

        loop {
            // Wait for: shutdown, notification, poll timeout, or reclaim sweep
            let wake = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("runner shutting down");
                    break;
                }
                notification = next_notification(subscription.as_mut()) => {
                    Wake::Notified(notification)
                }
                _ = poll.tick() => Wake::Poll,
                _ = sweep.tick() => Wake::Sweep,
            };

            match wake {
                Wake::Notified(Some(Notification::Event(event))) => {
                    if event.state != JobState::Pending {
                        continue;
                    }
                    debug!(job.id = %event.job_id, "notified of pending job");
                }
                Wake::Notified(Some(Notification::Resync { cursor })) => {
                    debug!(%cursor, "runner subscription resynced");
                    subscription = self.resubscribe().await;
                }
                Wake::Notified(Some(_)) => continue,
                Wake::Notified(None) => {
                    warn!("runner subscription ended, falling back to poll");
                    subscription = None;
                }
                Wake::Poll => {}
                Wake::Sweep => match self.machine.reclaim_expired().await {
                    Ok(jobs) if !jobs.is_empty() => {
                        info!(count = jobs.len(), "reclaimed timed-out jobs");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("reclaim sweep failed: {e}"),
                },
            }

            while let Some(done) = tasks.try_join_next() {
                if let Err(e) = done {
                    error!("job task panicked: {e}");
                }
            }
            if let Err(e) = self.dispatch_pending(&mut tasks).await {
                error!("dispatch_pending error: {e}");
            }
        }

        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!("job task panicked: {e}");
            }
        }
        Ok(())
    }

    async fn resubscribe(&self) -> Option<Subscription> {
        let dispatcher = self.dispatcher.as_ref()?;
        match dispatcher.subscribe(SubscriptionFilter::All, None).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("runner resubscribe failed: {e}");
                None
            }
        }
    }

    /// Claim as many pending jobs as there is capacity for.
    async fn dispatch_pending(&self, tasks: &mut JoinSet<()>) -> Result<()> {
        let capacity = self
            .config
            .max_concurrent
            .saturating_sub(self.active.load(Ordering::Relaxed));
        if capacity == 0 {
            return Ok(());
        }

        let pending = self
            .machine
            .list(&JobFilter::state(JobState::Pending).limit(capacity))
            .await?;

        for job in pending {
            match self.machine.claim(job.id).await {
                Ok(job) => {
                    self.active.fetch_add(1, Ordering::Relaxed);
                    let runner = self.clone();
                    tasks.spawn(async move { runner.execute(job).await });
                }
                Err(Error::ClaimConflict { id, state }) => {
                    debug!(job.id = %id, %state, "job claimed elsewhere");
                }
                Err(e) => warn!(job.id = %job.id, "claim failed: {e}"),
            }
        }
        Ok(())
    }

    /// Run the worker on a claimed job and record the outcome.
    async fn execute(&self, job: Job) {
        let span = start_job_span(self.worker.name(), &job.id, job.attempts);

        async {
            record_state_transition(&span, "pending", "processing");
            let started = Instant::now();
            let outcome = self.worker.process(job.id, &job.input).await;
            let duration_ms = started.elapsed().as_millis() as f64;

            let (label, recorded) = match outcome {
                Ok(answer) => (
                    "done",
                    self.machine.complete(job.id, job.attempts, answer).await,
                ),
                Err(e) => {
                    error!(job.id = %job.id, "worker failed: {e:#}");
                    let error = format!("{e:#}");
                    ("failed", self.machine.fail(job.id, job.attempts, error).await)
                }
            };

            metrics::job_duration_ms().record(
                duration_ms,
                &[
                    KeyValue::new("worker", self.worker.name().to_string()),
                    KeyValue::new("outcome", label),
                ],
            );

            match recorded {
                Ok(_) => {
                    record_state_transition(&span, "processing", label);
                    record_outcome(&span, label);
                    info!(job.id = %job.id, duration_ms, outcome = label, "job retired");
                }
                // our claim was reclaimed while we worked
                Err(Error::InvalidTransition { .. }) => record_outcome(&span, "superseded"),
                Err(e) => {
                    record_outcome(&span, "unrecorded");
                    error!(job.id = %job.id, "could not record outcome: {e}");
                }
            }
        }
        .instrument(span.clone())
        .await;

        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

enum Wake {
    Notified(Option<Notification>),
    Poll,
    Sweep,
}

async fn next_notification(subscription: Option<&mut Subscription>) -> Option<Notification> {
    match subscription {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}
