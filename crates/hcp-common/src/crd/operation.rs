//! Operation CRD types
//!
//! An `Operation` is the durable record of one accepted asynchronous write.
//! The frontend creates it with its spec set once; from then on only the
//! reconciler writes `status`, until `status.terminal` is true.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::SystemData;
use crate::{Error, ObjectKey, Result, RESOURCE_ID_ANNOTATION};

// =============================================================================
// State
// =============================================================================

/// Provisioning state label of an Operation
///
/// Stored as a free-form string. Labels outside the ARM set are kept verbatim
/// in `Other`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum OperationState {
    /// Request accepted, no work started
    #[default]
    Accepted,
    /// Work in progress
    Provisioning,
    /// Update in progress
    Updating,
    /// Deletion in progress
    Deleting,
    /// Work completed successfully
    Succeeded,
    /// Work failed permanently
    Failed,
    /// Work was canceled
    Canceled,
    /// Any other label
    Other(String),
}

impl OperationState {
    /// Whether this label is one of the terminal outcomes
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// The label as stored in `status.state`
    pub fn as_str(&self) -> &str {
        match self {
            Self::Accepted => "Accepted",
            Self::Provisioning => "Provisioning",
            Self::Updating => "Updating",
            Self::Deleting => "Deleting",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
            Self::Other(label) => label,
        }
    }
}

impl From<String> for OperationState {
    fn from(label: String) -> Self {
        const KNOWN: [OperationState; 7] = [
            OperationState::Accepted,
            OperationState::Provisioning,
            OperationState::Updating,
            OperationState::Deleting,
            OperationState::Succeeded,
            OperationState::Failed,
            OperationState::Canceled,
        ];
        KNOWN
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(&label))
            .unwrap_or(Self::Other(label))
    }
}

impl From<&str> for OperationState {
    fn from(label: &str) -> Self {
        Self::from(label.to_string())
    }
}

impl From<OperationState> for String {
    fn from(state: OperationState) -> Self {
        match state {
            OperationState::Other(label) => label,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Request envelope
// =============================================================================

/// The inbound write an Operation was created for, stored JSON-encoded in
/// `spec.request`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    /// HTTP method of the original request
    pub method: String,

    /// Lowercased ARM resource ID the request targeted
    pub resource_id: String,

    /// Request body, `null` when the request had none
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub body: serde_json::Value,

    /// Provenance forwarded by ARM, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_data: Option<SystemData>,

    /// When the frontend admitted the request, with sub-second precision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admitted_at: Option<DateTime<Utc>>,
}

// =============================================================================
// CRD
// =============================================================================

/// Long-running operation tracked for an ARM write request
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "arohcp.openshift.io",
    version = "v1alpha1",
    kind = "Operation",
    plural = "operations",
    shortname = "hcpop",
    namespaced,
    status = "OperationStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Terminal","type":"boolean","jsonPath":".status.terminal"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    /// JSON-encoded [`OperationRequest`]
    pub request: String,

    /// Correlation ID supplied by the caller
    pub external_id: String,

    /// Correlation ID assigned at admission
    pub internal_id: String,

    /// Where to notify the caller on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_uri: Option<String>,
}

/// Status of an Operation, owned by the reconciler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    /// Last time the status provider was consulted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<DateTime<Utc>>,

    /// Last time the state changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_time: Option<DateTime<Utc>>,

    /// Provisioning state label
    #[serde(default)]
    #[schemars(with = "String")]
    pub state: OperationState,

    /// Human-readable details about the current state
    #[serde(default)]
    pub details: String,

    /// Set once the operation reached its final outcome
    #[serde(default)]
    pub terminal: bool,
}

impl OperationStatus {
    /// Status of a freshly admitted operation
    pub fn accepted(now: DateTime<Utc>) -> Self {
        Self {
            last_probe_time: None,
            last_modified_time: Some(now),
            state: OperationState::Accepted,
            details: String::new(),
            terminal: false,
        }
    }
}

impl Operation {
    /// Build an accepted Operation for an admitted request
    ///
    /// The internal ID doubles as the object name.
    pub fn accepted(
        namespace: &str,
        request: &OperationRequest,
        external_id: impl Into<String>,
        internal_id: impl Into<String>,
        notification_uri: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let internal_id = internal_id.into();
        Ok(Operation {
            metadata: ObjectMeta {
                name: Some(internal_id.clone()),
                namespace: Some(namespace.to_string()),
                annotations: Some(BTreeMap::from([(
                    RESOURCE_ID_ANNOTATION.to_string(),
                    request.resource_id.clone(),
                )])),
                ..Default::default()
            },
            spec: OperationSpec {
                request: serde_json::to_string(request)?,
                external_id: external_id.into(),
                internal_id,
                notification_uri,
            },
            status: Some(OperationStatus::accepted(now)),
        })
    }

    /// Dedup key of this Operation
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Current state, `Accepted` when no status has been written yet
    pub fn state(&self) -> OperationState {
        self.status
            .as_ref()
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }

    /// Whether the reconciler has finalized this Operation
    pub fn is_terminal(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.terminal)
    }

    /// Admission time recorded in the request envelope
    ///
    /// `creationTimestamp` only has second resolution, so this is what orders
    /// Operations admitted for the same resource.
    pub fn admitted_at(&self) -> Option<DateTime<Utc>> {
        self.request().ok().and_then(|r| r.admitted_at)
    }

    /// ARM resource ID this Operation targets
    pub fn resource_id(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(RESOURCE_ID_ANNOTATION))
            .map(String::as_str)
    }

    /// Decode the request envelope stored in `spec.request`
    pub fn request(&self) -> Result<OperationRequest> {
        serde_json::from_str(&self.spec.request).map_err(|e| {
            Error::validation_for_field(self.key().to_string(), "spec.request", e.to_string())
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn sample_request() -> OperationRequest {
        OperationRequest {
            method: "PUT".to_string(),
            resource_id: "/subscriptions/sub/resourcegroups/rg/microsoft.redhatopenshift/hcpopenshiftclusters/c1".to_string(),
            body: serde_json::json!({"location": "eastus"}),
            system_data: None,
            admitted_at: None,
        }
    }

    #[test]
    fn state_labels_round_trip_through_strings() {
        assert_eq!(OperationState::from("Succeeded"), OperationState::Succeeded);
        assert_eq!(OperationState::from("succeeded"), OperationState::Succeeded);
        assert_eq!(
            OperationState::from("Pausing"),
            OperationState::Other("Pausing".to_string())
        );
        assert_eq!(String::from(OperationState::Canceled), "Canceled");
        assert_eq!(OperationState::Other("Pausing".into()).to_string(), "Pausing");
    }

    #[test]
    fn only_final_outcomes_are_terminal() {
        assert!(OperationState::Succeeded.is_terminal());
        assert!(OperationState::Failed.is_terminal());
        assert!(OperationState::Canceled.is_terminal());
        assert!(!OperationState::Accepted.is_terminal());
        assert!(!OperationState::Provisioning.is_terminal());
        assert!(!OperationState::Other("Done".into()).is_terminal());
    }

    #[test]
    fn accepted_operation_is_named_by_internal_id() {
        let now = Utc::now();
        let op = Operation::accepted("aro-hcp", &sample_request(), "ext-1", "int-1", None, now)
            .unwrap();

        assert_eq!(op.key(), ObjectKey::new("aro-hcp", "int-1"));
        assert_eq!(op.state(), OperationState::Accepted);
        assert!(!op.is_terminal());
        assert_eq!(op.spec.external_id, "ext-1");
        assert_eq!(op.resource_id(), Some(sample_request().resource_id.as_str()));
        assert_eq!(op.request().unwrap(), sample_request());
        assert_eq!(op.status.as_ref().unwrap().last_modified_time, Some(now));
    }

    #[test]
    fn admission_time_keeps_sub_second_precision() {
        let at = DateTime::parse_from_rfc3339("2024-06-10T12:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let request = OperationRequest {
            admitted_at: Some(at),
            ..sample_request()
        };
        let op = Operation::accepted("aro-hcp", &request, "e", "i", None, at).unwrap();

        assert!(op.spec.request.contains("\"admittedAt\""));
        assert_eq!(op.admitted_at(), Some(at));

        let legacy = Operation::accepted("aro-hcp", &sample_request(), "e", "j", None, at).unwrap();
        assert_eq!(legacy.admitted_at(), None);
    }

    #[test]
    fn status_serializes_with_camel_case_fields() {
        let status = OperationStatus {
            state: OperationState::Provisioning,
            terminal: false,
            details: "waiting".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "Provisioning");
        assert_eq!(json["terminal"], false);
        assert!(json.get("lastProbeTime").is_none());

        let back: OperationStatus =
            serde_json::from_value(serde_json::json!({"state": "Failed", "terminal": true}))
                .unwrap();
        assert_eq!(back.state, OperationState::Failed);
        assert!(back.terminal);
    }

    #[test]
    fn undecodable_request_is_a_validation_error() {
        let mut op = Operation::accepted("ns", &sample_request(), "e", "i", None, Utc::now())
            .unwrap();
        op.spec.request = "not json".into();
        let err = op.request().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn crd_definition_is_namespaced_with_status() {
        let crd = Operation::crd();
        assert_eq!(crd.spec.group, "arohcp.openshift.io");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "Operation");
        let yaml = serde_yaml::to_string(&crd).unwrap();
        assert!(yaml.contains("subresources"));
    }
}
