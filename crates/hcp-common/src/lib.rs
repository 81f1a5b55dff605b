//! Common types for the ARO HCP control plane: the Operation CRD, errors,
//! event recording, and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod key;
pub mod metrics;
pub mod telemetry;

pub use error::Error;
pub use key::ObjectKey;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace where Operation records live unless configured otherwise
pub const DEFAULT_OPERATIONS_NAMESPACE: &str = "aro-hcp";

/// Annotation carrying the ARM resource ID an Operation was created for
pub const RESOURCE_ID_ANNOTATION: &str = "arohcp.openshift.io/resource-id";

/// Field manager / reporting component name used for status writes and events
pub const CONTROLLER_NAME: &str = "operation-controller";
