//! ARM error responses
//!
//! Every rejection leaves the frontend as
//! `{"error": {"code": ..., "message": ..., "target": ...}}` with a status code
//! matching the error class.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

/// Symbolic error codes returned to ARM
pub mod codes {
    /// Unhandled failure or panic
    pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
    /// Body could not be read or exceeded the size ceiling
    pub const INVALID_RESOURCE: &str = "InvalidResource";
    /// Body is not valid JSON
    pub const INVALID_REQUEST_CONTENT: &str = "InvalidRequestContent";
    /// Content type other than `application/json`
    pub const UNSUPPORTED_MEDIA_TYPE: &str = "UnsupportedMediaType";
    /// Resource has no Operation on record
    pub const RESOURCE_NOT_FOUND: &str = "ResourceNotFound";
    /// Path matches no route
    pub const NOT_FOUND: &str = "NotFound";
    /// Write lost a race with another write
    pub const CONFLICT: &str = "Conflict";
}

/// Errors returned by the admission pipeline
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// Body unreadable or above the ceiling
    #[error("The resource definition is invalid.")]
    InvalidResource,

    /// Declared content type is not JSON
    #[error("The content media type '{content_type}' is not supported. Only 'application/json' is supported.")]
    UnsupportedMediaType {
        /// Raw `Content-Type` header value
        content_type: String,
    },

    /// Body is not valid JSON
    #[error("The request content was invalid and could not be deserialized: {message}")]
    InvalidRequestContent {
        /// Parser message
        message: String,
    },

    /// No record of the resource
    #[error("The resource '{resource_id}' was not found.")]
    ResourceNotFound {
        /// Resource ID that was requested
        resource_id: String,
    },

    /// Path matches no route
    #[error("The requested path '{path}' was not found.")]
    NotFound {
        /// Requested path
        path: String,
    },

    /// Concurrent write
    #[error("{message}")]
    Conflict {
        /// Conflict details
        message: String,
        /// Record that conflicted
        target: String,
    },

    /// Anything else; details are logged, not returned
    #[error("Internal server error.")]
    Internal,
}

impl CloudError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidResource | Self::InvalidRequestContent { .. } => StatusCode::BAD_REQUEST,
            Self::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::ResourceNotFound { .. } | Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Symbolic code from [`codes`]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidResource => codes::INVALID_RESOURCE,
            Self::UnsupportedMediaType { .. } => codes::UNSUPPORTED_MEDIA_TYPE,
            Self::InvalidRequestContent { .. } => codes::INVALID_REQUEST_CONTENT,
            Self::ResourceNotFound { .. } => codes::RESOURCE_NOT_FOUND,
            Self::NotFound { .. } => codes::NOT_FOUND,
            Self::Conflict { .. } => codes::CONFLICT,
            Self::Internal => codes::INTERNAL_SERVER_ERROR,
        }
    }

    fn target(&self) -> Option<String> {
        match self {
            Self::ResourceNotFound { resource_id } => Some(resource_id.clone()),
            Self::Conflict { target, .. } => Some(target.clone()),
            _ => None,
        }
    }
}

impl From<hcp_common::Error> for CloudError {
    fn from(err: hcp_common::Error) -> Self {
        match err {
            hcp_common::Error::NotFound { key } => Self::ResourceNotFound { resource_id: key },
            hcp_common::Error::Conflict { key, message } => Self::Conflict {
                message,
                target: key,
            },
            hcp_common::Error::Validation { message, .. } => {
                Self::InvalidRequestContent { message }
            }
            other => {
                error!(error = %other, "Request failed");
                Self::Internal
            }
        }
    }
}

/// Wire shape of an error response
#[derive(Debug, Serialize)]
struct CloudErrorBody {
    error: CloudErrorDetail,
}

#[derive(Debug, Serialize)]
struct CloudErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

impl IntoResponse for CloudError {
    fn into_response(self) -> Response {
        let body = CloudErrorBody {
            error: CloudErrorDetail {
                code: self.code(),
                message: self.to_string(),
                target: self.target(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}
