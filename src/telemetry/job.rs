//! Job execution span helpers.
//!
//! Provides span creation and state-transition recording for jobs flowing
//! through the worker runner.

use tracing::Span;

use crate::model::JobId;

/// Start a span for one job execution.
///
/// The `job.outcome` field is declared empty and filled in by
/// [`record_outcome`].
pub fn start_job_span(worker: &str, job_id: &JobId, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.worker" = worker,
        "job.id" = %job_id,
        "job.attempt" = attempt,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("job.outcome", outcome);
}
