//! Metric instrument factories for tandem-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("tandem-rs")
}

/// Counter: lock acquisition attempts.
/// Labels: `lock`, `result` ("acquired" | "timeout").
pub fn lock_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("tandem.lock.acquisitions")
        .with_description("Lock acquisition attempts by outcome")
        .build()
}

/// Counter: lock releases.
/// Labels: `lock`, `result` ("released" | "lost").
pub fn lock_releases() -> Counter<u64> {
    meter()
        .u64_counter("tandem.lock.releases")
        .with_description("Lock releases by outcome")
        .build()
}

/// Counter: queue operations.
/// Labels: `queue`, `operation` ("push" | "pop" | "pop_empty" | "ack" | "requeue").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("tandem.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: channel traffic.
/// Labels: `channel`, `message` ("request" | "response" | "notification").
pub fn channel_messages() -> Counter<u64> {
    meter()
        .u64_counter("tandem.channel.messages")
        .with_description("Requests, responses and notifications sent on channels")
        .build()
}

/// Histogram: time spent parked in a blocking call, in milliseconds.
/// Labels: `operation`.
pub fn wait_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("tandem.wait.duration_ms")
        .with_description("Time spent waiting in blocking operations")
        .with_unit("ms")
        .build()
}
