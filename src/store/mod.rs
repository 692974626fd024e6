//! Job store abstraction: durable records plus an ordered change feed.
//!
//! The store knows nothing about the lifecycle rules. It offers a
//! compare-and-swap `update` and the state machine builds every transition
//! on top of it.

pub mod memory;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use crate::error::Result;
use crate::event::ChangeEvent;
use crate::model::{Expected, Job, JobFilter, JobId, JobPatch, NewJob, Sequence, UpdateOutcome};

pub use memory::InMemoryJobStore;

/// A position-anchored view of the change feed.
///
/// `backlog` holds every event after the requested cursor up to `head`;
/// `live` yields events after `head` as they are committed. The live stream
/// ending means the feed connection was lost and must be reopened.
pub struct ChangeFeed {
    pub head: Sequence,
    pub backlog: Vec<ChangeEvent>,
    pub live: BoxStream<'static, ChangeEvent>,
}

impl ChangeFeed {
    /// Backlog followed by live events as one stream.
    pub fn into_stream(self) -> BoxStream<'static, ChangeEvent> {
        stream::iter(self.backlog).chain(self.live).boxed()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("head", &self.head)
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}

/// Durable table of job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` record. Idempotent on `new.id`: re-submitting
    /// the same id returns the existing record without a second event.
    async fn create(&self, new: NewJob) -> Result<Job>;

    async fn get(&self, id: JobId) -> Result<Job>;

    /// Matching records ordered by `created_at`, ties by id.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Apply `patch` only if the stored record still matches `expected`.
    async fn update(&self, id: JobId, expected: Expected, patch: JobPatch)
    -> Result<UpdateOutcome>;

    /// Open the change feed. With `since = Some(c)` the backlog replays every
    /// event with sequence > c; with `None` it starts at the current head.
    async fn change_feed(&self, since: Option<Sequence>) -> Result<ChangeFeed>;

    /// Every recorded event with sequence > `since`, without going live.
    async fn replay(&self, since: Sequence) -> Result<Vec<ChangeEvent>> {
        Ok(self.change_feed(Some(since)).await?.backlog)
    }
}
