//! In-process job store for tests and local development.
//!
//! The change feed is a `tokio::sync::broadcast` channel. Subscribing under
//! the same lock that appends events keeps the backlog and live stream
//! gap-free. Fault injection covers an unreachable store and a dropped feed.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use futures::stream;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use super::{ChangeFeed, JobStore};
use crate::error::{Error, Result};
use crate::event::ChangeEvent;
use crate::model::{
    Expected, Job, JobFilter, JobId, JobPatch, JobState, NewJob, Sequence, UpdateOutcome,
};

const DEFAULT_FEED_CAPACITY: usize = 1024;

struct Inner {
    jobs: HashMap<JobId, Job>,
    events: Vec<ChangeEvent>,
    available: bool,
    feed: broadcast::Sender<ChangeEvent>,
}

impl Inner {
    fn head(&self) -> Sequence {
        self.events.last().map(|e| e.sequence).unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("in-memory store offline".to_string()))
        }
    }

    fn append(&mut self, job: &Job) {
        let event = ChangeEvent::from_job(self.head().next(), job);
        self.events.push(event.clone());
        // no receivers is fine
        let _ = self.feed.send(event);
    }
}

pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    feed_capacity: usize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    /// A small capacity makes slow live readers lose the feed quickly.
    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                events: Vec::new(),
                available: true,
                feed,
            }),
            feed_capacity: capacity.max(1),
        }
    }

    /// Simulate the store going offline (or coming back).
    pub async fn set_available(&self, available: bool) {
        self.inner.lock().await.available = available;
        debug!(available, "in-memory store availability changed");
    }

    /// Terminate every open live feed, as a dropped connection would.
    pub async fn drop_feeds(&self) {
        let mut inner = self.inner.lock().await;
        let (feed, _) = broadcast::channel(self.feed_capacity);
        inner.feed = feed;
        debug!("in-memory store feeds dropped");
    }

    /// Number of events appended so far.
    pub async fn event_count(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    /// Rewrite a job's `updated_at` without emitting an event. Test hook for
    /// aging a claim past the reclaim timeout.
    pub async fn backdate(&self, id: JobId, updated_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or(Error::NotFound(id))?;
        job.updated_at = updated_at;
        Ok(())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Next `updated_at`, strictly after the previous one.
fn next_timestamp(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    let floor = prev + Duration::microseconds(1);
    if now > floor { now } else { floor }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new: NewJob) -> Result<Job> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;

        if let Some(existing) = inner.jobs.get(&new.id) {
            if existing.session_id != new.session_id || existing.input != new.input {
                return Err(Error::Validation(format!(
                    "job id {} already used for a different submission",
                    new.id
                )));
            }
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let job = Job {
            id: new.id,
            session_id: new.session_id,
            input: new.input,
            state: JobState::Pending,
            result: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(job.id, job.clone());
        inner.append(&job);
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        inner.jobs.get(&id).cloned().ok_or(Error::NotFound(id))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;

        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn update(
        &self,
        id: JobId,
        expected: Expected,
        patch: JobPatch,
    ) -> Result<UpdateOutcome> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;

        let job = inner.jobs.get_mut(&id).ok_or(Error::NotFound(id))?;
        let matches = job.state == expected.state
            && expected.attempts.is_none_or(|a| a == job.attempts);
        if !matches {
            return Ok(UpdateOutcome::Conflict(job.clone()));
        }

        job.state = patch.state;
        job.result = patch.result;
        job.error = patch.error;
        if patch.increment_attempts {
            job.attempts += 1;
        }
        job.updated_at = next_timestamp(job.updated_at);
        let job = job.clone();

        inner.append(&job);
        Ok(UpdateOutcome::Applied(job))
    }

    async fn change_feed(&self, since: Option<Sequence>) -> Result<ChangeFeed> {
        let inner = self.inner.lock().await;
        inner.check_available()?;

        let head = inner.head();
        let rx = inner.feed.subscribe();
        let backlog = match since {
            Some(cursor) => inner
                .events
                .iter()
                .filter(|e| e.sequence > cursor)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        drop(inner);

        let live = stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.sequence <= head => continue,
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "in-memory feed reader lagged, closing");
                        return None;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed();

        Ok(ChangeFeed {
            head,
            backlog,
            live,
        })
    }
}
