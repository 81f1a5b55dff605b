//! Queue instruments
//!
//! All instruments carry a `name` label identifying the queue.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("hcp-workqueue"));

/// Items waiting to be checked out
pub(crate) static QUEUE_DEPTH: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("hcp_workqueue_depth")
        .with_description("Current number of items ready for processing")
        .with_unit("{items}")
        .build()
});

/// Adds accepted by the queue, including coalesced ones
pub(crate) static QUEUE_ADDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("hcp_workqueue_adds_total")
        .with_description("Total number of adds handled by the queue")
        .with_unit("{items}")
        .build()
});

/// Rate-limited re-adds
pub(crate) static QUEUE_RETRIES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("hcp_workqueue_retries_total")
        .with_description("Total number of rate-limited retries")
        .with_unit("{items}")
        .build()
});

pub(crate) fn record_depth(queue: &str, depth: usize) {
    QUEUE_DEPTH.record(depth as u64, &[KeyValue::new("name", queue.to_string())]);
}

pub(crate) fn record_add(queue: &str) {
    QUEUE_ADDS.add(1, &[KeyValue::new("name", queue.to_string())]);
}

pub(crate) fn record_retry(queue: &str) {
    QUEUE_RETRIES.add(1, &[KeyValue::new("name", queue.to_string())]);
}
