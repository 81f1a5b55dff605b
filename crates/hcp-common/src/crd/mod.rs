//! Custom Resource Definitions for the ARO HCP control plane

mod operation;
mod system_data;

pub use operation::{Operation, OperationRequest, OperationSpec, OperationState, OperationStatus};
pub use system_data::{CreatedByType, SystemData};
