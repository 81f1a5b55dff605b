//! ARM request provenance
//!
//! ARM forwards the identity and timestamps of the caller that created or last
//! modified a resource. The frontend attaches them to each Operation request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of identity that created or modified a resource
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum CreatedByType {
    /// An application (service principal)
    Application,
    /// A storage or API key
    Key,
    /// A managed identity
    ManagedIdentity,
    /// A user principal
    User,
}

impl std::fmt::Display for CreatedByType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Application => write!(f, "Application"),
            Self::Key => write!(f, "Key"),
            Self::ManagedIdentity => write!(f, "ManagedIdentity"),
            Self::User => write!(f, "User"),
        }
    }
}

/// Creation and modification metadata for a resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemData {
    /// Identity that created the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    /// Type of the creating identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_type: Option<CreatedByType>,

    /// Creation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Identity that last modified the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<String>,

    /// Type of the last modifying identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by_type: Option<CreatedByType>,

    /// Last modification timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<DateTime<Utc>>,
}
