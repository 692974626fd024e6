//! The per-session local view: optimistic entries merged with authoritative
//! job snapshots into one ordered, deduplicated list.
//!
//! Pure data structure with no I/O; the session actor is the only mutator.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::event::ChangeEvent;
use crate::model::{Job, JobId, JobState, Sequence};

/// Where an entry's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Optimistic,
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "state", rename_all = "snake_case")]
pub enum EntryStatus {
    /// Submitted locally, not yet seen in the store.
    Optimistic,
    /// Backed by the store's record in the given state.
    Confirmed(JobState),
    /// Optimistic entry that was never confirmed in time. Shown as
    /// "unknown / retry".
    Stale,
}

impl EntryStatus {
    pub fn label(self) -> &'static str {
        match self {
            EntryStatus::Optimistic => "optimistic",
            EntryStatus::Confirmed(JobState::Pending) => "confirmed-pending",
            EntryStatus::Confirmed(JobState::Processing) => "confirmed-processing",
            EntryStatus::Confirmed(JobState::Done) => "confirmed-done",
            EntryStatus::Confirmed(JobState::Failed) => "confirmed-failed",
            EntryStatus::Stale => "stale",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Confirmed(s) if s.is_terminal())
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewEntry {
    pub id: JobId,
    pub input: String,
    pub status: EntryStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Local submission time until confirmed, then the store's.
    pub created_at: DateTime<Utc>,
    /// Store's `updated_at` of the snapshot applied last.
    pub updated_at: Option<DateTime<Utc>>,
    /// Feed sequence of the event applied last, if it came from the feed.
    pub sequence: Option<Sequence>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ViewEntry {
    pub fn provenance(&self) -> Provenance {
        match self.status {
            EntryStatus::Confirmed(_) => Provenance::Confirmed,
            EntryStatus::Optimistic | EntryStatus::Stale => Provenance::Optimistic,
        }
    }

    fn confirmed(
        job: &Job,
        sequence: Option<Sequence>,
        submitted_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: job.id,
            input: job.input.clone(),
            status: EntryStatus::Confirmed(job.state),
            result: job.result.clone(),
            error: job.error.clone(),
            created_at: job.created_at,
            updated_at: Some(job.updated_at),
            sequence,
            submitted_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    /// A new entry appeared.
    Added,
    /// An optimistic (or stale) entry was matched to its store record.
    Confirmed,
    /// A confirmed entry moved forward.
    Updated,
    /// An optimistic entry timed out unconfirmed.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewUpdate {
    pub change: Change,
    pub entry: ViewEntry,
}

/// What to do with an incoming snapshot for an existing confirmed entry.
enum Freshness {
    Newer,
    /// Same snapshot seen through the other transport. Adopt its sequence
    /// without reporting a change.
    Same,
    Older,
}

fn freshness(
    entry: &ViewEntry,
    updated_at: DateTime<Utc>,
    sequence: Option<Sequence>,
) -> Freshness {
    if let (Some(have), Some(got)) = (entry.sequence, sequence) {
        return if got > have {
            Freshness::Newer
        } else {
            Freshness::Older
        };
    }
    match entry.updated_at {
        None => Freshness::Newer,
        Some(have) if updated_at > have => Freshness::Newer,
        Some(have) if updated_at == have => Freshness::Same,
        Some(_) => Freshness::Older,
    }
}

#[derive(Debug, Clone)]
pub struct View {
    entries: HashMap<JobId, ViewEntry>,
    optimistic_timeout: TimeDelta,
}

impl View {
    pub fn new(optimistic_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            optimistic_timeout: TimeDelta::from_std(optimistic_timeout).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Entries ordered by `created_at`, ties by id.
    pub fn entries(&self) -> Vec<ViewEntry> {
        let mut out: Vec<ViewEntry> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        out
    }

    pub fn get(&self, id: JobId) -> Option<&ViewEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Show a locally submitted job before the store has confirmed it.
    pub fn insert_optimistic(
        &mut self,
        id: JobId,
        input: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<ViewUpdate> {
        if self.entries.contains_key(&id) {
            return None;
        }
        let entry = ViewEntry {
            id,
            input: input.into(),
            status: EntryStatus::Optimistic,
            result: None,
            error: None,
            created_at: now,
            updated_at: None,
            sequence: None,
            submitted_at: Some(now),
        };
        self.entries.insert(id, entry.clone());
        Some(ViewUpdate {
            change: Change::Added,
            entry,
        })
    }

    /// Merge one feed event. Duplicates and out-of-order events are no-ops.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> Option<ViewUpdate> {
        self.merge(&event.to_job(), Some(event.sequence))
    }

    /// Merge one authoritative snapshot that did not come from the feed.
    pub fn apply_snapshot(&mut self, job: &Job) -> Option<ViewUpdate> {
        self.merge(job, None)
    }

    /// Merge a complete listing of the session's jobs.
    ///
    /// Listed jobs merge under the same freshness rule as events, so an old
    /// listing never rolls an entry back. Optimistic entries missing from the
    /// listing go stale once past the timeout. Confirmed entries missing
    /// from it are kept.
    pub fn reconcile_full(&mut self, jobs: &[Job], now: DateTime<Utc>) -> Vec<ViewUpdate> {
        let mut updates: Vec<ViewUpdate> =
            jobs.iter().filter_map(|j| self.merge(j, None)).collect();
        updates.extend(self.expire_optimistic(now));
        updates
    }

    /// Mark optimistic entries older than the timeout as stale.
    pub fn expire_optimistic(&mut self, now: DateTime<Utc>) -> Vec<ViewUpdate> {
        let timeout = self.optimistic_timeout;
        let mut updates = Vec::new();
        for entry in self.entries.values_mut() {
            let expired = entry.status == EntryStatus::Optimistic
                && entry.submitted_at.is_some_and(|t| now - t >= timeout);
            if expired {
                entry.status = EntryStatus::Stale;
                updates.push(ViewUpdate {
                    change: Change::Stale,
                    entry: entry.clone(),
                });
            }
        }
        updates
    }

    /// Give up on an optimistic entry right away, e.g. when its submission
    /// failed permanently.
    pub fn mark_stale(&mut self, id: JobId) -> Option<ViewUpdate> {
        let entry = self.entries.get_mut(&id)?;
        if entry.status != EntryStatus::Optimistic {
            return None;
        }
        entry.status = EntryStatus::Stale;
        Some(ViewUpdate {
            change: Change::Stale,
            entry: entry.clone(),
        })
    }

    fn merge(&mut self, job: &Job, sequence: Option<Sequence>) -> Option<ViewUpdate> {
        let Some(entry) = self.entries.get_mut(&job.id) else {
            let entry = ViewEntry::confirmed(job, sequence, None);
            self.entries.insert(job.id, entry.clone());
            return Some(ViewUpdate {
                change: Change::Added,
                entry,
            });
        };

        match entry.status {
            EntryStatus::Optimistic | EntryStatus::Stale => {
                *entry = ViewEntry::confirmed(job, sequence, entry.submitted_at);
                Some(ViewUpdate {
                    change: Change::Confirmed,
                    entry: entry.clone(),
                })
            }
            EntryStatus::Confirmed(_) => match freshness(entry, job.updated_at, sequence) {
                Freshness::Newer => {
                    *entry = ViewEntry::confirmed(job, sequence, entry.submitted_at);
                    Some(ViewUpdate {
                        change: Change::Updated,
                        entry: entry.clone(),
                    })
                }
                Freshness::Same => {
                    if entry.sequence.is_none() {
                        entry.sequence = sequence;
                    }
                    None
                }
                Freshness::Older => None,
            },
        }
    }
}
