//! Metrics for the ARO HCP control plane
//!
//! Provides OpenTelemetry instruments for:
//! - Operation sync (duration, outcome)
//! - Operation terminal transitions
//! - Admission requests (verb, status class)

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("hcp"));

// ============================================================================
// Sync Metrics
// ============================================================================

/// Histogram of sync step duration
///
/// Labels:
/// - `result`: done, requeue, error, panic
pub static SYNC_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("hcp_operation_sync_duration_seconds")
        .with_description("Duration of a single Operation sync in seconds")
        .with_unit("s")
        .build()
});

/// Counter of Operations reaching a terminal state
///
/// Labels:
/// - `state`: Succeeded, Failed, Canceled
pub static OPERATIONS_TERMINAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("hcp_operations_terminal_total")
        .with_description("Total number of Operations finalized, by state")
        .with_unit("{operations}")
        .build()
});

// ============================================================================
// Admission Metrics
// ============================================================================

/// Counter of admission requests
///
/// Labels:
/// - `method`: HTTP method
/// - `status`: 2xx, 4xx, 5xx
pub static ADMISSION_REQUESTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("hcp_admission_requests_total")
        .with_description("Total number of requests handled by the frontend")
        .with_unit("{requests}")
        .build()
});

// ============================================================================
// Label Types
// ============================================================================

/// Label for how a sync invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    /// Finished, key forgotten
    Done,
    /// Asked to be retried later
    Requeue,
    /// Returned an error
    Error,
    /// Panicked
    Panic,
}

impl SyncResult {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Requeue => "requeue",
            Self::Error => "error",
            Self::Panic => "panic",
        }
    }
}

/// Label for an HTTP response class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx
    Success,
    /// 4xx
    ClientError,
    /// everything else
    ServerError,
}

impl StatusClass {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "2xx",
            Self::ClientError => "4xx",
            Self::ServerError => "5xx",
        }
    }

    /// Classify an HTTP status code
    pub fn from_status_code(code: u16) -> Self {
        match code {
            200..=299 => Self::Success,
            400..=499 => Self::ClientError,
            _ => Self::ServerError,
        }
    }
}

// ============================================================================
// Recording Helpers
// ============================================================================

/// Times one sync invocation
pub struct SyncTimer {
    start: Instant,
}

impl SyncTimer {
    /// Start timing
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record the duration under `result`
    pub fn finish(self, result: SyncResult) {
        SYNC_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", result.as_str())],
        );
    }
}

/// Record an Operation reaching `state`
pub fn record_terminal(state: &str) {
    OPERATIONS_TERMINAL.add(1, &[KeyValue::new("state", state.to_string())]);
}

/// Record one admission response
pub fn record_admission(method: &str, status: u16) {
    ADMISSION_REQUESTS.add(
        1,
        &[
            KeyValue::new("method", method.to_string()),
            KeyValue::new("status", StatusClass::from_status_code(status).as_str()),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_class_from_code() {
        assert_eq!(StatusClass::from_status_code(201), StatusClass::Success);
        assert_eq!(StatusClass::from_status_code(415), StatusClass::ClientError);
        assert_eq!(StatusClass::from_status_code(500), StatusClass::ServerError);
    }

    #[test]
    fn sync_result_labels() {
        assert_eq!(SyncResult::Done.as_str(), "done");
        assert_eq!(SyncResult::Panic.as_str(), "panic");
    }

    #[test]
    fn recording_without_provider_is_harmless() {
        SyncTimer::start().finish(SyncResult::Requeue);
        record_terminal("Succeeded");
        record_admission("PUT", 201);
    }
}
