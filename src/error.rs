//! Error types for sakhi-rs.

use thiserror::Error;

use crate::model::{JobId, JobState};

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed submission. Rejected before anything reaches the store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Another worker already owns this job. Expected under contention.
    #[error("job {id} already claimed (state: {state})")]
    ClaimConflict { id: JobId, state: JobState },

    /// Transition attempted from the wrong prior state, usually a duplicate
    /// or stale worker completion.
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Reclaim requested for a processing job whose claim has not timed out.
    #[error("job {0} claim has not expired")]
    NotExpired(JobId),

    #[error("job store unavailable: {0}")]
    StoreUnavailable(String),

    /// A locally submitted job was never confirmed by the store.
    #[error("no confirmation received for job {0}")]
    StaleOptimisticEntry(JobId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Infrastructure failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::StoreUnavailable(_) | Error::Io(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_infrastructure_errors_are_transient() {
        assert!(Error::StoreUnavailable("down".into()).is_transient());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!Error::Validation("empty".into()).is_transient());
        assert!(
            !Error::ClaimConflict {
                id: JobId::new(),
                state: JobState::Processing,
            }
            .is_transient()
        );
    }
}
