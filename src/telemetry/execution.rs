//! Execution span helpers.
//!
//! One span per execution task, covering admission through event
//! publication. Status transitions are recorded as events on that span.

use tracing::Span;

use crate::model::{ExchangeId, Status, WorkflowKind};

/// Start a span for one execution.
///
/// The `execution.status` field is declared empty and updated by
/// [`record_state_transition`].
pub fn start_execution_span(kind: WorkflowKind, exchange_id: ExchangeId) -> Span {
    tracing::info_span!(
        "execution.run",
        "execution.kind" = kind.as_str(),
        "execution.id" = %exchange_id,
        "execution.status" = tracing::field::Empty,
    )
}

/// Record a status transition on the span and in the metrics.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("execution.status", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
    super::metrics::state_transitions().add(
        1,
        &[
            opentelemetry::KeyValue::new("from", from.as_str()),
            opentelemetry::KeyValue::new("to", to.as_str()),
        ],
    );
}
