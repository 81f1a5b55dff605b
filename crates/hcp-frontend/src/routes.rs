//! Routing table and per-verb handlers
//!
//! Paths are matched after lowercasing, so every literal segment here is
//! lowercase. Write verbs admit exactly one Operation each; read verbs derive
//! the resource view from the latest Operation recorded for the resource.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use hcp_common::crd::{Operation, OperationRequest, OperationState, SystemData};
use hcp_common::ObjectKey;
use hcp_operator::store::OperationStore;

use crate::arm::CloudError;
use crate::middleware::{OriginalPath, Provenance};

/// Resource provider namespace, lowercase
pub const PROVIDER_NAMESPACE: &str = "microsoft.redhatopenshift";

/// Header carrying the caller's correlation ID
pub const CORRELATION_REQUEST_ID_HEADER: &str = "x-ms-correlation-request-id";

/// Header naming where to notify the caller on completion
pub const ASYNC_NOTIFICATION_URI_HEADER: &str = "azure-asyncnotificationuri";

/// Response header pointing at the Operation poll route
pub const ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Where admitted Operations are written
    pub store: Arc<dyn OperationStore>,
    /// Namespace Operations are created in
    pub namespace: String,
}

/// `/subscriptions/{sub}/resourcegroups/{rg}/{provider}/{type}`
#[derive(Debug, Deserialize)]
struct ParentPath {
    subscription_id: String,
    resource_group: String,
    resource_type: String,
}

impl ParentPath {
    fn id(&self) -> String {
        format!(
            "/subscriptions/{}/resourcegroups/{}/{}/{}",
            self.subscription_id, self.resource_group, PROVIDER_NAMESPACE, self.resource_type
        )
    }
}

/// `/subscriptions/{sub}/resourcegroups/{rg}/{provider}/{type}/{name}`
#[derive(Debug, Deserialize)]
struct ResourcePath {
    subscription_id: String,
    resource_group: String,
    resource_type: String,
    resource_name: String,
}

impl ResourcePath {
    fn id(&self) -> String {
        format!(
            "/subscriptions/{}/resourcegroups/{}/{}/{}/{}",
            self.subscription_id,
            self.resource_group,
            PROVIDER_NAMESPACE,
            self.resource_type,
            self.resource_name
        )
    }
}

/// Resource as returned by read and list
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceView {
    id: String,
    name: String,
    #[serde(rename = "type")]
    type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_data: Option<SystemData>,
    properties: ResourceProperties,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceProperties {
    provisioning_state: String,
}

impl ResourceView {
    fn from_operation(id: String, op: &Operation) -> Self {
        let request = op.request().ok();
        let mut segments = id.rsplit('/');
        let name = segments.next().unwrap_or_default().to_string();
        let resource_type = segments.next().unwrap_or_default();
        Self {
            name,
            type_: format!("{PROVIDER_NAMESPACE}/{resource_type}"),
            system_data: request.and_then(|r| r.system_data),
            properties: ResourceProperties {
                provisioning_state: op.state().to_string(),
            },
            id,
        }
    }
}

#[derive(Debug, Serialize)]
struct ResourceList {
    value: Vec<ResourceView>,
}

/// Build the routing table
pub fn router(state: AppState) -> Router {
    let parent = format!(
        "/subscriptions/{{subscription_id}}/resourcegroups/{{resource_group}}/{PROVIDER_NAMESPACE}/{{resource_type}}"
    );
    let resource = format!("{parent}/{{resource_name}}");

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(&parent, get(list_resources))
        .route(
            &resource,
            get(read_resource)
                .put(create_or_update_resource)
                .patch(patch_resource)
                .delete(delete_resource)
                .post(resource_action),
        )
        .route("/operations/{namespace}/{name}", get(read_operation))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found(Extension(original): Extension<OriginalPath>) -> CloudError {
    CloudError::NotFound { path: original.0 }
}

// =============================================================================
// Reads
// =============================================================================

/// Latest Operation per resource ID
async fn latest_operations(state: &AppState) -> Result<BTreeMap<String, Operation>, CloudError> {
    Ok(latest_by_resource(state.store.list(&state.namespace).await?))
}

/// Keep the most recently admitted Operation for each resource ID
///
/// Ranked by admission time, then creation time, then name.
fn latest_by_resource(ops: Vec<Operation>) -> BTreeMap<String, Operation> {
    let rank = |o: &Operation| {
        (
            o.admitted_at(),
            o.metadata.creation_timestamp.clone(),
            o.name_any(),
        )
    };

    let mut latest: BTreeMap<String, Operation> = BTreeMap::new();
    for op in ops {
        let Some(id) = op.resource_id().map(str::to_string) else {
            continue;
        };
        let newer = latest
            .get(&id)
            .map_or(true, |current| rank(&op) > rank(current));
        if newer {
            latest.insert(id, op);
        }
    }
    latest
}

/// A resource exists unless its latest Operation is a completed delete
fn is_live(op: &Operation) -> bool {
    let deleted = op
        .request()
        .is_ok_and(|r| r.method.eq_ignore_ascii_case("DELETE"));
    !(deleted && op.state() == OperationState::Succeeded)
}

async fn list_resources(
    State(state): State<AppState>,
    Path(path): Path<ParentPath>,
) -> Result<Json<ResourceList>, CloudError> {
    let prefix = format!("{}/", path.id());
    let value = latest_operations(&state)
        .await?
        .into_iter()
        .filter(|(id, op)| {
            id.strip_prefix(&prefix)
                .is_some_and(|name| !name.is_empty() && !name.contains('/'))
                && is_live(op)
        })
        .map(|(id, op)| ResourceView::from_operation(id, &op))
        .collect();
    Ok(Json(ResourceList { value }))
}

async fn read_resource(
    State(state): State<AppState>,
    Path(path): Path<ResourcePath>,
) -> Result<Json<ResourceView>, CloudError> {
    let id = path.id();
    let latest = latest_operations(&state).await?;
    match latest.get(&id) {
        Some(op) if is_live(op) => Ok(Json(ResourceView::from_operation(id, op))),
        _ => Err(CloudError::ResourceNotFound { resource_id: id }),
    }
}

async fn read_operation(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Operation>, CloudError> {
    let op = state.store.get(&ObjectKey::new(namespace, name)).await?;
    Ok(Json(op))
}

// =============================================================================
// Writes
// =============================================================================

/// Inputs shared by every write verb
struct WriteRequest {
    method: Method,
    path: ResourcePath,
    original: OriginalPath,
    provenance: Provenance,
    headers: HeaderMap,
    body: Bytes,
}

async fn create_or_update_resource(
    State(state): State<AppState>,
    Path(path): Path<ResourcePath>,
    Extension(original): Extension<OriginalPath>,
    Extension(provenance): Extension<Provenance>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, CloudError> {
    let write = WriteRequest {
        method: Method::PUT,
        path,
        original,
        provenance,
        headers,
        body,
    };
    admit(&state, write, StatusCode::CREATED).await
}

async fn patch_resource(
    State(state): State<AppState>,
    Path(path): Path<ResourcePath>,
    Extension(original): Extension<OriginalPath>,
    Extension(provenance): Extension<Provenance>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, CloudError> {
    let write = WriteRequest {
        method: Method::PATCH,
        path,
        original,
        provenance,
        headers,
        body,
    };
    admit(&state, write, StatusCode::ACCEPTED).await
}

async fn delete_resource(
    State(state): State<AppState>,
    Path(path): Path<ResourcePath>,
    Extension(original): Extension<OriginalPath>,
    Extension(provenance): Extension<Provenance>,
    headers: HeaderMap,
) -> Result<Response, CloudError> {
    let write = WriteRequest {
        method: Method::DELETE,
        path,
        original,
        provenance,
        headers,
        body: Bytes::new(),
    };
    admit(&state, write, StatusCode::ACCEPTED).await
}

async fn resource_action(
    State(state): State<AppState>,
    Path(path): Path<ResourcePath>,
    Extension(original): Extension<OriginalPath>,
    Extension(provenance): Extension<Provenance>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, CloudError> {
    let write = WriteRequest {
        method: Method::POST,
        path,
        original,
        provenance,
        headers,
        body,
    };
    admit(&state, write, StatusCode::ACCEPTED).await
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Validate the body and write the Operation for an accepted request
async fn admit(
    state: &AppState,
    write: WriteRequest,
    success: StatusCode,
) -> Result<Response, CloudError> {
    let body = if write.body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&write.body).map_err(|e| CloudError::InvalidRequestContent {
            message: e.to_string(),
        })?
    };

    let now = Utc::now();
    let resource_id = write.path.id();
    let request = OperationRequest {
        method: write.method.to_string(),
        resource_id: resource_id.clone(),
        body,
        system_data: write.provenance.0,
        admitted_at: Some(now),
    };
    let external_id = header_string(&write.headers, CORRELATION_REQUEST_ID_HEADER)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let internal_id = Uuid::new_v4().to_string();
    let notification_uri = header_string(&write.headers, ASYNC_NOTIFICATION_URI_HEADER);

    let op = Operation::accepted(
        &state.namespace,
        &request,
        external_id,
        internal_id,
        notification_uri,
        now,
    )?;
    let created = state.store.create(op).await?;
    let key = created.key();

    info!(
        operation = %key,
        method = %write.method,
        path = %write.original.0,
        "Admitted request"
    );
    debug!(resource_id = %resource_id, external_id = %created.spec.external_id, "Operation created");

    let poll = format!("/operations/{}/{}", key.namespace, key.name);
    let mut response = (success, Json(created)).into_response();
    if let Ok(value) = HeaderValue::from_str(&poll) {
        response.headers_mut().insert(ASYNC_OPERATION_HEADER, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use hcp_operator::store::MemoryStore;
    use tower::ServiceExt;

    use crate::middleware::{with_interceptors, MAX_BODY_BYTES, SYSTEM_DATA_HEADER};

    const CLUSTER: &str = "/subscriptions/sub-1/resourceGroups/RG-1/Microsoft.RedHatOpenShift/hcpOpenShiftClusters/Cluster-A";
    const CLUSTER_ID: &str = "/subscriptions/sub-1/resourcegroups/rg-1/microsoft.redhatopenshift/hcpopenshiftclusters/cluster-a";

    fn app(store: Arc<MemoryStore>) -> Router {
        with_interceptors(
            router(AppState {
                store,
                namespace: "aro-hcp".to_string(),
            }),
            MAX_BODY_BYTES,
        )
    }

    async fn send(store: &Arc<MemoryStore>, request: Request<Body>) -> (StatusCode, HeaderMap, serde_json::Value) {
        let response = app(store.clone())
            .oneshot(request)
            .await
            .expect("request should succeed");
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body reading should succeed");
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).expect("body should be JSON")
        };
        (status, headers, json)
    }

    fn request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder().method(method).uri(uri)
    }

    #[tokio::test]
    async fn put_without_body_admits_an_accepted_operation() {
        let store = Arc::new(MemoryStore::new());
        let (status, headers, body) =
            send(&store, request("PUT", CLUSTER).body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"]["state"], "Accepted");
        assert_eq!(body["status"]["terminal"], false);

        let ops = store.list("aro-hcp").await.unwrap();
        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert_eq!(op.resource_id(), Some(CLUSTER_ID));
        assert_eq!(op.spec.internal_id, op.key().name);
        assert!(op.spec.notification_uri.is_none());

        let request = op.request().unwrap();
        assert_eq!(request.method, "PUT");
        assert!(request.body.is_null());

        let poll = headers.get(ASYNC_OPERATION_HEADER).unwrap().to_str().unwrap();
        assert_eq!(poll, format!("/operations/aro-hcp/{}", op.key().name));
    }

    #[tokio::test]
    async fn correlation_headers_are_recorded() {
        let store = Arc::new(MemoryStore::new());
        let (status, _, _) = send(
            &store,
            request("PATCH", CLUSTER)
                .header(header::CONTENT_TYPE, "application/json")
                .header(CORRELATION_REQUEST_ID_HEADER, "corr-123")
                .header(ASYNC_NOTIFICATION_URI_HEADER, "https://arm.example/notify")
                .body(Body::from(r#"{"properties":{"version":"4.16"}}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let op = store.list("aro-hcp").await.unwrap().remove(0);
        assert_eq!(op.spec.external_id, "corr-123");
        assert_eq!(
            op.spec.notification_uri.as_deref(),
            Some("https://arm.example/notify")
        );
        assert_eq!(op.request().unwrap().body["properties"]["version"], "4.16");
    }

    #[tokio::test]
    async fn oversized_put_creates_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (status, _, body) = send(
            &store,
            request("PUT", CLUSTER)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(vec![b'x'; 2 * 1024 * 1024]))
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "InvalidResource");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn text_plain_is_rejected_with_415() {
        let store = Arc::new(MemoryStore::new());
        let (status, _, body) = send(
            &store,
            request("PUT", CLUSTER)
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body["error"]["code"], "UnsupportedMediaType");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn invalid_json_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let (status, _, body) = send(
            &store,
            request("PUT", CLUSTER)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "InvalidRequestContent");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn provenance_is_embedded_when_valid_and_dropped_when_malformed() {
        let store = Arc::new(MemoryStore::new());
        send(
            &store,
            request("PUT", CLUSTER)
                .header(
                    SYSTEM_DATA_HEADER,
                    r#"{"createdBy":"alice@example.com","createdByType":"User"}"#,
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let (status, _, _) = send(
            &store,
            request("DELETE", CLUSTER)
                .header(SYSTEM_DATA_HEADER, "definitely-not-json")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let mut requests: Vec<_> = store
            .list("aro-hcp")
            .await
            .unwrap()
            .iter()
            .map(|op| op.request().unwrap())
            .collect();
        requests.sort_by(|a, b| b.method.cmp(&a.method));
        assert_eq!(requests[0].method, "PUT");
        assert_eq!(
            requests[0].system_data.as_ref().unwrap().created_by.as_deref(),
            Some("alice@example.com")
        );
        assert_eq!(requests[1].method, "DELETE");
        assert!(requests[1].system_data.is_none());
    }

    #[tokio::test]
    async fn reads_follow_the_latest_operation() {
        let store = Arc::new(MemoryStore::new());
        let (status, _, body) =
            send(&store, request("GET", CLUSTER).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "ResourceNotFound");
        assert_eq!(body["error"]["target"], CLUSTER_ID);

        send(&store, request("PUT", CLUSTER).body(Body::empty()).unwrap()).await;
        let (status, _, body) =
            send(&store, request("GET", CLUSTER).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], CLUSTER_ID);
        assert_eq!(body["name"], "cluster-a");
        assert_eq!(body["type"], "microsoft.redhatopenshift/hcpopenshiftclusters");
        assert_eq!(body["properties"]["provisioningState"], "Accepted");

        let parent = CLUSTER.rsplit_once('/').unwrap().0;
        let (status, _, body) =
            send(&store, request("GET", parent).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"].as_array().unwrap().len(), 1);
    }

    fn admitted(name: &str, method: &str, at: chrono::DateTime<Utc>) -> Operation {
        let request = OperationRequest {
            method: method.to_string(),
            resource_id: CLUSTER_ID.to_string(),
            admitted_at: Some(at),
            ..Default::default()
        };
        let mut op = Operation::accepted("aro-hcp", &request, "ext", name, None, at).unwrap();
        // Kubernetes truncates creationTimestamp to whole seconds
        op.metadata.creation_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::DateTime::from_timestamp(at.timestamp(), 0).unwrap(),
        ));
        op
    }

    #[test]
    fn delete_admitted_in_the_same_second_wins() {
        let put_at = chrono::DateTime::parse_from_rfc3339("2024-06-10T12:00:00.100Z")
            .unwrap()
            .with_timezone(&Utc);
        let delete_at = put_at + chrono::Duration::milliseconds(300);

        // Names sort opposite to admission order
        let put = admitted("zzzz", "PUT", put_at);
        let mut delete = admitted("aaaa", "DELETE", delete_at);
        delete.status = Some(hcp_common::crd::OperationStatus {
            state: OperationState::Succeeded,
            terminal: true,
            ..Default::default()
        });
        assert_eq!(
            put.metadata.creation_timestamp,
            delete.metadata.creation_timestamp
        );

        for ops in [vec![put.clone(), delete.clone()], vec![delete, put]] {
            let latest = latest_by_resource(ops);
            let op = &latest[CLUSTER_ID];
            assert_eq!(op.name_any(), "aaaa");
            assert!(!is_live(op));
        }
    }

    #[tokio::test]
    async fn operations_can_be_polled_by_key() {
        let store = Arc::new(MemoryStore::new());
        let (_, headers, _) =
            send(&store, request("PUT", CLUSTER).body(Body::empty()).unwrap()).await;
        let poll = headers.get(ASYNC_OPERATION_HEADER).unwrap().to_str().unwrap().to_string();

        let (status, _, body) = send(&store, request("GET", &poll).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["state"], "Accepted");

        let (status, _, body) = send(
            &store,
            request("GET", "/operations/aro-hcp/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "ResourceNotFound");
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let store = Arc::new(MemoryStore::new());
        let (status, _, body) = send(
            &store,
            request("GET", "/subscriptions/sub-1/providers")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NotFound");
    }

    #[tokio::test]
    async fn health_check() {
        let store = Arc::new(MemoryStore::new());
        let response = app(store)
            .oneshot(request("GET", "/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
