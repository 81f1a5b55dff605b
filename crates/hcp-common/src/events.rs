//! Kubernetes Event recording for Operation lifecycle transitions.
//!
//! The reconciler receives an [`EventPublisher`] at construction so that
//! transitions show up in `kubectl describe operation` without a process-wide
//! recorder.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use parking_lot::Mutex;
use tracing::warn;

use crate::crd::Operation;

/// Sink for Operation lifecycle events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event about `op`
    ///
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - What was done (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        op: &Operation,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        op: &Operation,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &op.object_ref(&())).await {
            warn!(
                operation = %op.key(),
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _op: &Operation,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// A captured event, as seen by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// `namespace/name` of the Operation
    pub key: String,
    /// Whether this was a Warning event
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event action
    pub action: String,
    /// Event note
    pub note: Option<String>,
}

/// Publisher that keeps events in memory, for tests and local runs
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Reasons published so far, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        op: &Operation,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(RecordedEvent {
            key: op.key().to_string(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Operation moved from Accepted to Provisioning
    pub const PROVISIONING_STARTED: &str = "ProvisioningStarted";
    /// Operation reached Succeeded
    pub const OPERATION_SUCCEEDED: &str = "OperationSucceeded";
    /// Operation reached Failed
    pub const OPERATION_FAILED: &str = "OperationFailed";
    /// Operation reached Canceled
    pub const OPERATION_CANCELED: &str = "OperationCanceled";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Querying the status provider
    pub const PROBE: &str = "Probe";
}
