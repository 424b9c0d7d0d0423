//! Metric instrument factories for chatwarden.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"chatwarden"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("chatwarden")
}

/// Counter: moderation jobs submitted to the partition manager.
/// Labels: `partition`, `result` ("queued" | "duplicate" | "rejected").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("chatwarden.jobs.submitted")
        .with_description("Number of moderation jobs submitted")
        .build()
}

/// Counter: jobs finished by a partition worker.
/// Labels: `partition`, `result` ("ok" | "error" | "timeout").
pub fn job_completions() -> Counter<u64> {
    meter()
        .u64_counter("chatwarden.jobs.completed")
        .with_description("Number of moderation jobs finished")
        .build()
}

/// Counter: verdicts produced by the pipeline.
/// Labels: `source` ("cache" | "classifier" | "policy" | "rate-limited"), `outcome`.
pub fn verdicts() -> Counter<u64> {
    meter()
        .u64_counter("chatwarden.verdicts")
        .with_description("Number of verdicts by provenance and outcome")
        .build()
}

/// Counter: admission decisions taken by the rate limiter.
/// Labels: `result` ("accepted" | "rejected" | "timed_out").
pub fn admission_decisions() -> Counter<u64> {
    meter()
        .u64_counter("chatwarden.limiter.admissions")
        .with_description("Number of rate limiter admission decisions")
        .build()
}

/// Counter: circuit breaker state changes.
/// Labels: `from`, `to`.
pub fn circuit_transitions() -> Counter<u64> {
    meter()
        .u64_counter("chatwarden.limiter.circuit_transitions")
        .with_description("Number of circuit breaker transitions")
        .build()
}

/// Counter: verdict cache lookups.
/// Labels: `result` ("hit" | "miss").
pub fn cache_lookups() -> Counter<u64> {
    meter()
        .u64_counter("chatwarden.cache.lookups")
        .with_description("Number of verdict cache lookups")
        .build()
}

/// Counter: outbox action executions.
/// Labels: `action`, `result` ("completed" | "retry" | "failed").
pub fn outbox_executions() -> Counter<u64> {
    meter()
        .u64_counter("chatwarden.outbox.executions")
        .with_description("Number of outbox action executions")
        .build()
}

/// Counter: durable queue operations (send, read, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("chatwarden.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("chatwarden.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
