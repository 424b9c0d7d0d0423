//! GenAI semantic convention span helpers for classifier calls.
//!
//! Fields follow the OpenTelemetry GenAI conventions so classifier latency
//! and token spend line up with other LLM-backed services in a trace view.

use tracing::Span;

/// Start a span for one classification request.
///
/// The finish reason is declared empty and filled once the provider answers.
pub fn start_chat_span(model: &str, provider: &str) -> Span {
    tracing::info_span!(
        "gen_ai.chat",
        "gen_ai.operation.name" = "chat",
        "gen_ai.request.model" = model,
        "gen_ai.provider.name" = provider,
        "gen_ai.response.finish_reasons" = tracing::field::Empty,
    )
}

/// Record why the provider stopped generating (or why the call failed).
pub fn record_finish_reason(span: &Span, reason: &str) {
    span.record("gen_ai.response.finish_reasons", reason);
}
