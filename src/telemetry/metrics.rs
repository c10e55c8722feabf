//! Metric instrument factories for portalflow.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op, so recording is
//! always safe.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("portalflow")
}

/// Counter: workflow submissions.
/// Labels: `kind`, `result` ("admitted" | "duplicate" | "invalid" | "error").
pub fn submissions() -> Counter<u64> {
    meter()
        .u64_counter("portalflow.executions.submitted")
        .with_description("Number of workflow submissions")
        .build()
}

/// Counter: execution status transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("portalflow.executions.state_transitions")
        .with_description("Number of execution status transitions")
        .build()
}

/// Counter: runner attempts.
/// Labels: `kind`, `outcome` ("ok" | "retriable" | "terminal").
pub fn runner_attempts() -> Counter<u64> {
    meter()
        .u64_counter("portalflow.runner.attempts")
        .with_description("Number of runner attempts")
        .build()
}

/// Counter: terminal event deliveries.
/// Labels: `result` ("ok" | "failed").
pub fn events_published() -> Counter<u64> {
    meter()
        .u64_counter("portalflow.events.published")
        .with_description("Terminal event publish outcomes")
        .build()
}

/// Counter: queue-level operations on the event log.
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("portalflow.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: execution duration in milliseconds, admission to terminal.
/// Labels: `kind`, `status`.
pub fn execution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("portalflow.execution.duration_ms")
        .with_description("Execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
