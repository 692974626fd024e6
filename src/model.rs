//! Core data model.
//!
//! A job is one user query awaiting an asynchronous answer. It has a stable
//! identity (assigned before the store sees it), belongs to a chat session,
//! and moves through a small lifecycle owned by the state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for job IDs. Time-ordered so equal `created_at` ties sort stably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Validation(format!("invalid job id {s:?}: {e}")))
    }
}

/// A chat session. Every job belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Validation(format!("invalid session id {s:?}: {e}")))
    }
}

/// Position in the store's change feed. Strictly increasing per store.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, waiting for a worker.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Answer available. Terminal.
    Done,
    /// Worker gave up. Terminal.
    Failed,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Done)
                | (Processing, Failed)
                | (Processing, Pending) // reclaim after claim timeout
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "done" => Ok(JobState::Done),
            "failed" => Ok(JobState::Failed),
            _ => Err(Error::Other(format!("unknown job state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// The store's record for one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub session_id: SessionId,
    /// The question as the user typed it. Immutable.
    pub input: String,
    pub state: JobState,
    /// Present only when `state == Done`.
    pub result: Option<String>,
    /// Present only when `state == Failed`.
    pub error: Option<String>,
    /// Number of successful claims so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Result/error presence matches the state.
    pub fn is_consistent(&self) -> bool {
        match self.state {
            JobState::Pending | JobState::Processing => {
                self.result.is_none() && self.error.is_none()
            }
            JobState::Done => self.result.is_some() && self.error.is_none(),
            JobState::Failed => self.error.is_some() && self.result.is_none(),
        }
    }
}

/// A submission. The id is chosen by the submitter so the same value
/// correlates the optimistic entry, the record and every event.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub session_id: SessionId,
    pub input: String,
}

impl NewJob {
    pub fn new(session_id: SessionId, input: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            session_id,
            input: input.into(),
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_input(&self.input)
    }
}

/// Reject inputs that can never produce a useful answer.
pub fn validate_input(input: &str) -> Result<()> {
    if input.trim().is_empty() {
        return Err(Error::Validation("input must not be empty".to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Store update primitives
// ---------------------------------------------------------------------------

/// Precondition for a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub state: JobState,
    /// When set, the update also requires this exact attempt count.
    pub attempts: Option<u32>,
}

impl From<JobState> for Expected {
    fn from(state: JobState) -> Self {
        Self {
            state,
            attempts: None,
        }
    }
}

/// Fields written by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPatch {
    pub state: JobState,
    pub result: Option<String>,
    pub error: Option<String>,
    pub increment_attempts: bool,
}

impl JobPatch {
    pub fn claim() -> Self {
        Self {
            state: JobState::Processing,
            result: None,
            error: None,
            increment_attempts: true,
        }
    }

    pub fn complete(result: impl Into<String>) -> Self {
        Self {
            state: JobState::Done,
            result: Some(result.into()),
            error: None,
            increment_attempts: false,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            result: None,
            error: Some(error.into()),
            increment_attempts: false,
        }
    }

    pub fn reclaim() -> Self {
        Self {
            state: JobState::Pending,
            result: None,
            error: None,
            increment_attempts: false,
        }
    }
}

/// Outcome of a compare-and-swap update.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Precondition held; the returned record is the new state.
    Applied(Job),
    /// Precondition failed; the record as currently stored.
    Conflict(Job),
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Narrowing for `list`. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub session_id: Option<SessionId>,
    pub state: Option<JobState>,
    pub ids: Option<Vec<JobId>>,
    /// Only jobs whose last transition happened before this instant.
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn session(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Default::default()
        }
    }

    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_ids(mut self, ids: Vec<JobId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.session_id.is_none_or(|s| job.session_id == s)
            && self.state.is_none_or(|s| job.state == s)
            && self.ids.as_ref().is_none_or(|ids| ids.contains(&job.id))
            && self.updated_before.is_none_or(|t| job.updated_at < t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lifecycle_edges_are_allowed() {
        use JobState::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Done));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Done));
        assert!(!Pending.can_transition_to(Failed));
        for terminal in [Done, Failed] {
            assert!(terminal.is_terminal());
            for to in [Pending, Processing, Done, Failed] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn state_round_trips_through_text() {
        for s in [
            JobState::Pending,
            JobState::Processing,
            JobState::Done,
            JobState::Failed,
        ] {
            assert_eq!(s.to_string().parse::<JobState>().unwrap(), s);
        }
        assert!("queued".parse::<JobState>().is_err());
    }

    #[test]
    fn blank_input_is_rejected() {
        assert!(matches!(validate_input("   \n"), Err(Error::Validation(_))));
        assert!(validate_input("I am facing workplace harassment").is_ok());
    }

    #[test]
    fn filter_combines_conditions() {
        let session = SessionId::new();
        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            session_id: session,
            input: "q".into(),
            state: JobState::Pending,
            result: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };

        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::session(session).with_state(JobState::Pending).matches(&job));
        assert!(!JobFilter::session(SessionId::new()).matches(&job));
        assert!(!JobFilter::state(JobState::Done).matches(&job));
        assert!(!JobFilter::default().with_ids(vec![JobId::new()]).matches(&job));
        assert!(!JobFilter::default().updated_before(now).matches(&job));
    }
}
