//! Metric instrument factories for sakhi-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"sakhi-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for sakhi-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("sakhi-rs")
}

/// Counter: jobs submitted.
/// Labels: `result` ("ok" | "invalid").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("sakhi.jobs.submitted")
        .with_description("Number of jobs submitted")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("sakhi.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: claims lost to another worker.
pub fn claim_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("sakhi.jobs.claim_conflicts")
        .with_description("Claims that lost the compare-and-swap")
        .build()
}

/// Counter: rejected transitions.
/// Labels: `from`, `to`.
pub fn invalid_transitions() -> Counter<u64> {
    meter()
        .u64_counter("sakhi.jobs.invalid_transitions")
        .with_description("Transitions rejected because the job was in the wrong state")
        .build()
}

/// Counter: timed-out claims returned to pending.
pub fn jobs_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("sakhi.jobs.reclaimed")
        .with_description("Timed-out claims returned to pending")
        .build()
}

/// Histogram: worker execution time in milliseconds.
/// Labels: `worker`, `outcome` ("done" | "failed").
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("sakhi.jobs.duration_ms")
        .with_description("Worker execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: notifications handed to subscribers.
/// Labels: `kind` ("live" | "replay").
pub fn dispatcher_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("sakhi.dispatcher.deliveries")
        .with_description("Events delivered to subscribers")
        .build()
}

/// Counter: subscribers disconnected for falling behind.
pub fn slow_consumer_drops() -> Counter<u64> {
    meter()
        .u64_counter("sakhi.dispatcher.slow_consumer_drops")
        .with_description("Subscriptions dropped because their buffer was full")
        .build()
}

/// Counter: change feed reconnect attempts.
/// Labels: `result` ("ok" | "error").
pub fn feed_reconnects() -> Counter<u64> {
    meter()
        .u64_counter("sakhi.dispatcher.feed_reconnects")
        .with_description("Change feed reconnect attempts")
        .build()
}

/// Counter: optimistic entries that were never confirmed in time.
pub fn stale_optimistic_entries() -> Counter<u64> {
    meter()
        .u64_counter("sakhi.reconciler.stale_entries")
        .with_description("Optimistic entries that timed out unconfirmed")
        .build()
}
