//! Error types for the ARO HCP control plane
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the operation key or provider it relates to, and
//! [`Error::is_retryable`] drives the reconciler's requeue-versus-fail decision.

use thiserror::Error;

/// Main error type for control plane operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The record addressed by a key does not exist in the store
    #[error("operation {key} not found")]
    NotFound {
        /// `namespace/name` of the missing record
        key: String,
    },

    /// A compare-and-write lost against a concurrent writer
    #[error("conflict writing {key}: {message}")]
    Conflict {
        /// `namespace/name` of the contended record
        key: String,
        /// Description of the conflict
        message: String,
    },

    /// Validation error for keys or request contents
    #[error("validation error for {operation}: {message}")]
    Validation {
        /// Key or identifier of the thing being validated
        operation: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.request")
        field: Option<String>,
    },

    /// External status provider error
    #[error("provider error [{provider}] for {operation}: {message}")]
    Provider {
        /// Key of the operation being probed
        operation: String,
        /// Provider name (static, http)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The kind of document being processed (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "controller", "cache")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for the given key
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a conflict error for the given key
    pub fn conflict(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with operation context
    pub fn validation_for(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            operation: operation.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with operation context and field path
    pub fn validation_for_field(
        operation: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            operation: operation.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a transient provider error with full context
    pub fn provider_for(
        operation: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            operation: operation.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (the backend rejected the request)
    pub fn provider_permanent(
        operation: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            operation: operation.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and not-found errors need a change in input.
    /// Conflicts and provider outages resolve on their own.
    /// Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
                }
                _ => true,
            },
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => true,
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error means the addressed record does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization_for_kind("json", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    /// Story: provider outages are absorbed by the queue, domain rejections are final
    #[test]
    fn story_provider_errors_split_into_transient_and_permanent() {
        let err = Error::provider_for("aro-hcp/op-1", "http", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[http]"));
        assert!(err.to_string().contains("aro-hcp/op-1"));

        let err = Error::provider_permanent("aro-hcp/op-1", "http", "invalid subnet");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("invalid subnet"));
    }

    /// Story: a lost compare-and-write is retried, a deleted record is not
    #[test]
    fn story_store_errors_drive_requeue_decisions() {
        let err = Error::conflict("aro-hcp/op-1", "resource version 3 is stale");
        assert!(err.is_retryable());
        assert!(!err.is_not_found());

        let err = Error::not_found("aro-hcp/op-1");
        assert!(!err.is_retryable());
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "operation aro-hcp/op-1 not found");
    }

    #[test]
    fn kube_api_errors_classified_by_status_code() {
        assert!(!api_error(400).is_retryable());
        assert!(!api_error(404).is_retryable());
        assert!(api_error(404).is_not_found());
        assert!(api_error(409).is_retryable());
        assert!(api_error(429).is_retryable());
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
    }

    #[test]
    fn validation_errors_carry_field_paths() {
        let err = Error::validation_for_field("aro-hcp/op-1", "spec.request", "not JSON");
        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.request")),
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err = Error::from(parse.unwrap_err());
        match &err {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("json")),
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_errors_keep_context() {
        let err = Error::internal_with_context("controller", "worker panicked");
        assert!(err.is_retryable());
        assert!(matches!(&err, Error::Internal { context, .. } if context == "controller"));
        assert!(err.to_string().contains("[controller]"));
    }
}
