//! Interceptor chain applied before routing
//!
//! Outermost first:
//! 1. metrics: count every response by method and status class
//! 2. panic containment: a panicking handler becomes a 500 `InternalServerError`
//! 3. body capture: buffer write bodies up to a ceiling and check the media type
//! 4. path lowercasing: resource types and names match case-insensitively
//! 5. provenance: parse the ARM system data header if present
//!
//! Lowercasing rewrites the URI, so the chain wraps the router as a service
//! instead of being added with `Router::layer`, which only runs after routing.

use std::any::Any;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::uri::PathAndQuery;
use axum::http::{header, Method, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use hcp_common::crd::SystemData;
use hcp_common::metrics;

use crate::arm::CloudError;

/// Largest request body accepted on write verbs
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Header ARM uses to forward request provenance
pub const SYSTEM_DATA_HEADER: &str = "x-ms-arm-resource-system-data";

/// Request path as received, before lowercasing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginalPath(pub String);

/// Provenance parsed from [`SYSTEM_DATA_HEADER`]; `None` when absent or malformed
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Provenance(pub Option<SystemData>);

/// Wrap `router` in the full interceptor chain
pub fn with_interceptors(router: Router, max_body_bytes: usize) -> Router {
    let chain = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(record_metrics))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(max_body_bytes, capture_body))
        .layer(middleware::from_fn(lowercase_path))
        .layer(middleware::from_fn(extract_system_data))
        .service(router);

    Router::new().fallback_service(chain)
}

async fn record_metrics(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let response = next.run(request).await;
    metrics::record_admission(method.as_str(), response.status().as_u16());
    response
}

/// Convert a handler panic into an ARM error response
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %message, "Request handler panicked");
    CloudError::Internal.into_response()
}

/// Buffer PUT/PATCH/POST bodies and reject oversized or non-JSON payloads
async fn capture_body(State(limit): State<usize>, request: Request, next: Next) -> Response {
    if !matches!(*request.method(), Method::PUT | Method::PATCH | Method::POST) {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, limit, "Rejecting unreadable request body");
            return CloudError::InvalidResource.into_response();
        }
    };

    let declared = parts
        .headers
        .get(header::CONTENT_TYPE)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();
    let media_type = declared.split(';').next().unwrap_or_default().trim();
    let is_json = media_type.eq_ignore_ascii_case("application/json");
    if !is_json && !(bytes.is_empty() && media_type.is_empty()) {
        return CloudError::UnsupportedMediaType {
            content_type: declared,
        }
        .into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

/// Lowercase the path before routing, keeping the original in extensions
async fn lowercase_path(mut request: Request, next: Next) -> Response {
    let original = request.uri().path().to_string();
    let lowered = original.to_lowercase();

    if lowered != original {
        let path_and_query = match request.uri().query() {
            Some(query) => format!("{lowered}?{query}"),
            None => lowered,
        };
        let mut parts = request.uri().clone().into_parts();
        match path_and_query.parse::<PathAndQuery>() {
            Ok(pq) => {
                parts.path_and_query = Some(pq);
                match Uri::from_parts(parts) {
                    Ok(uri) => *request.uri_mut() = uri,
                    Err(e) => warn!(error = %e, path = %original, "Keeping path as received"),
                }
            }
            Err(e) => warn!(error = %e, path = %original, "Keeping path as received"),
        }
    }

    request.extensions_mut().insert(OriginalPath(original));
    next.run(request).await
}

/// Attach [`Provenance`]; a malformed header is logged and ignored
async fn extract_system_data(mut request: Request, next: Next) -> Response {
    let provenance = request.headers().get(SYSTEM_DATA_HEADER).and_then(|value| {
        match serde_json::from_slice::<SystemData>(value.as_bytes()) {
            Ok(system_data) => Some(system_data),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed system data header");
                None
            }
        }
    });

    request.extensions_mut().insert(Provenance(provenance));
    next.run(request).await
}
