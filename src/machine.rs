//! Job state machine: the only writer of lifecycle transitions.
//!
//! Every transition is a compare-and-swap against the store, so the claim
//! `pending -> processing` has exactly one winner no matter how many workers
//! race for it. Transient store failures are retried here and never reach
//! callers as anything but `StoreUnavailable` once retries run out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Expected, Job, JobFilter, JobId, JobPatch, JobState, NewJob, UpdateOutcome};
use crate::retry::{RetryPolicy, with_retry};
use crate::store::JobStore;
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub retry: RetryPolicy,
    /// A claim older than this may be reclaimed.
    pub reclaim_after: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reclaim_after: Duration::from_secs(300),
        }
    }
}

#[derive(Clone)]
pub struct JobMachine {
    store: Arc<dyn JobStore>,
    config: MachineConfig,
}

impl JobMachine {
    pub fn new(store: Arc<dyn JobStore>, config: MachineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Register a new `pending` job.
    pub async fn submit(&self, new: NewJob) -> Result<Job> {
        if let Err(e) = new.validate() {
            metrics::jobs_submitted().add(1, &[KeyValue::new("result", "invalid")]);
            return Err(e);
        }

        let job = with_retry(&self.config.retry, "job.submit", || {
            self.store.create(new.clone())
        })
        .await?;

        metrics::jobs_submitted().add(1, &[KeyValue::new("result", "ok")]);
        info!(job.id = %job.id, session.id = %job.session_id, "job submitted");
        Ok(job)
    }

    /// Claim a pending job. Losing the race is `ClaimConflict`, which callers
    /// treat as "someone else has it".
    pub async fn claim(&self, id: JobId) -> Result<Job> {
        match self.update(id, JobState::Pending.into(), JobPatch::claim()).await? {
            UpdateOutcome::Applied(job) => {
                record_transition(&job, JobState::Pending);
                Ok(job)
            }
            UpdateOutcome::Conflict(actual) => {
                metrics::claim_conflicts().add(1, &[]);
                debug!(job.id = %id, state = %actual.state, "claim lost");
                Err(Error::ClaimConflict {
                    id,
                    state: actual.state,
                })
            }
        }
    }

    /// `processing -> done` with the worker's answer.
    ///
    /// `attempt` is the job's `attempts` as returned by the claim. A worker
    /// whose claim was reclaimed (and possibly re-claimed by someone else)
    /// gets `InvalidTransition` and changes nothing.
    pub async fn complete(
        &self,
        id: JobId,
        attempt: u32,
        result: impl Into<String>,
    ) -> Result<Job> {
        self.finish(id, attempt, JobPatch::complete(result)).await
    }

    /// `processing -> failed` with the worker's error. Guarded on `attempt`
    /// like [`complete`](Self::complete).
    pub async fn fail(&self, id: JobId, attempt: u32, error: impl Into<String>) -> Result<Job> {
        self.finish(id, attempt, JobPatch::fail(error)).await
    }

    async fn finish(&self, id: JobId, attempt: u32, patch: JobPatch) -> Result<Job> {
        let to = patch.state;
        let expected = Expected {
            state: JobState::Processing,
            attempts: Some(attempt),
        };
        match self.update(id, expected, patch).await? {
            UpdateOutcome::Applied(job) => {
                record_transition(&job, JobState::Processing);
                Ok(job)
            }
            UpdateOutcome::Conflict(actual) => {
                if actual.state == JobState::Processing {
                    debug!(
                        job.id = %id,
                        attempt,
                        current = actual.attempts,
                        "completion from a superseded claim"
                    );
                }
                Err(invalid_transition(id, actual.state, to))
            }
        }
    }

    /// Return a timed-out claim to `pending` so it can be claimed again.
    ///
    /// Only allowed once the claim is older than `reclaim_after`. The update
    /// is guarded on the attempt number, so a job that was reclaimed and
    /// claimed again in the meantime is left alone.
    pub async fn reclaim(&self, id: JobId) -> Result<Job> {
        let job = self.get(id).await?;
        if job.state != JobState::Processing {
            return Err(invalid_transition(id, job.state, JobState::Pending));
        }
        if !self.claim_expired(&job) {
            return Err(Error::NotExpired(id));
        }

        let expected = Expected {
            state: JobState::Processing,
            attempts: Some(job.attempts),
        };
        match self.update(id, expected, JobPatch::reclaim()).await? {
            UpdateOutcome::Applied(job) => {
                record_transition(&job, JobState::Processing);
                metrics::jobs_reclaimed().add(1, &[]);
                warn!(job.id = %id, attempts = job.attempts, "claim timed out, job reclaimed");
                Ok(job)
            }
            // re-claimed by a new worker since we looked
            UpdateOutcome::Conflict(actual) if actual.state == JobState::Processing => {
                Err(Error::NotExpired(id))
            }
            UpdateOutcome::Conflict(actual) => {
                Err(invalid_transition(id, actual.state, JobState::Pending))
            }
        }
    }

    /// Reclaim every processing job whose claim has expired.
    pub async fn reclaim_expired(&self) -> Result<Vec<Job>> {
        let cutoff = Utc::now() - self.reclaim_after();
        let stuck = self
            .list(&JobFilter::state(JobState::Processing).updated_before(cutoff))
            .await?;

        let mut reclaimed = Vec::new();
        for job in stuck {
            match self.reclaim(job.id).await {
                Ok(job) => reclaimed.push(job),
                Err(Error::NotExpired(_) | Error::InvalidTransition { .. }) => {
                    debug!(job.id = %job.id, "job moved on before reclaim");
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!(job.id = %job.id, error = %e, "reclaim failed"),
            }
        }
        Ok(reclaimed)
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        with_retry(&self.config.retry, "job.get", || self.store.get(id)).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        with_retry(&self.config.retry, "job.list", || self.store.list(filter)).await
    }

    fn reclaim_after(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.reclaim_after).unwrap_or(TimeDelta::MAX)
    }

    fn claim_expired(&self, job: &Job) -> bool {
        Utc::now() - job.updated_at >= self.reclaim_after()
    }

    async fn update(
        &self,
        id: JobId,
        expected: Expected,
        patch: JobPatch,
    ) -> Result<UpdateOutcome> {
        with_retry(&self.config.retry, "job.update", || {
            self.store.update(id, expected, patch.clone())
        })
        .await
    }
}

fn record_transition(job: &Job, from: JobState) {
    metrics::job_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", job.state.as_str()),
        ],
    );
    info!(
        job.id = %job.id,
        from = from.as_str(),
        to = job.state.as_str(),
        attempts = job.attempts,
        "state_transition"
    );
}

fn invalid_transition(id: JobId, from: JobState, to: JobState) -> Error {
    metrics::invalid_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
    warn!(job.id = %id, from = from.as_str(), to = to.as_str(), "invalid transition rejected");
    Error::InvalidTransition { id, from, to }
}
