//! Change events emitted by the job store on every persisted transition.
//!
//! An event is a snapshot of a job at the moment it changed, stamped with the
//! store's feed sequence. Consumers resume from the last sequence they saw.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Job, JobId, JobState, Sequence, SessionId};

/// Result or error carried by a terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Result(String),
    Error(String),
}

/// A job's state as observed at one position in the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Strictly increasing per store. Consumers can detect gaps.
    pub sequence: Sequence,
    pub job_id: JobId,
    pub session_id: SessionId,
    pub state: JobState,
    pub payload: Option<Payload>,
    pub input: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Snapshot a job at the given feed position.
    pub fn from_job(sequence: Sequence, job: &Job) -> Self {
        let payload = match (&job.result, &job.error) {
            (Some(r), _) => Some(Payload::Result(r.clone())),
            (None, Some(e)) => Some(Payload::Error(e.clone())),
            (None, None) => None,
        };
        Self {
            sequence,
            job_id: job.id,
            session_id: job.session_id,
            state: job.state,
            payload,
            input: job.input.clone(),
            attempts: job.attempts,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }

    pub fn result(&self) -> Option<&str> {
        match &self.payload {
            Some(Payload::Result(r)) => Some(r),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.payload {
            Some(Payload::Error(e)) => Some(e),
            _ => None,
        }
    }

    /// Rebuild the job record this event describes.
    pub fn to_job(&self) -> Job {
        Job {
            id: self.job_id,
            session_id: self.session_id,
            input: self.input.clone(),
            state: self.state,
            result: self.result().map(str::to_string),
            error: self.error().map(str::to_string),
            attempts: self.attempts,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
