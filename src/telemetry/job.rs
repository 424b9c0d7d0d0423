//! Job processing span helpers.
//!
//! Spans cover a moderation job from dequeue to verdict inside a
//! partition worker.

use tracing::Span;

/// Start a span for processing one job.
///
/// `job.source` and `job.outcome` are declared empty and filled in once the
/// pipeline has produced a verdict.
pub fn start_job_span(partition: u32, key: &str) -> Span {
    tracing::info_span!(
        "job.process",
        "job.partition" = partition,
        "job.key" = key,
        "job.source" = tracing::field::Empty,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record the verdict on a job span.
pub fn record_verdict(span: &Span, source: &str, outcome: &str) {
    span.record("job.source", source);
    span.record("job.outcome", outcome);
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
