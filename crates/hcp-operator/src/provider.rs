//! External status providers
//!
//! A provider answers one question for the reconciler: what is the real-world
//! state of the work behind this Operation. Retryable errors mean "ask again
//! later"; non-retryable errors mean the backend rejected the work for good.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use hcp_common::crd::{Operation, OperationState};
use hcp_common::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Real-world status of an Operation's work
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Work is still running
    InProgress {
        /// Progress message
        details: String,
    },
    /// Work finished successfully
    Succeeded {
        /// Completion message
        details: String,
    },
    /// Work failed and will not be retried
    Failed {
        /// Failure reason
        details: String,
    },
    /// Work was canceled
    Canceled {
        /// Cancellation reason
        details: String,
    },
}

impl ProbeStatus {
    /// In-progress status with no message
    pub fn in_progress() -> Self {
        Self::InProgress {
            details: String::new(),
        }
    }

    /// Succeeded status with no message
    pub fn succeeded() -> Self {
        Self::Succeeded {
            details: String::new(),
        }
    }

    /// Failed status with `details`
    pub fn failed(details: impl Into<String>) -> Self {
        Self::Failed {
            details: details.into(),
        }
    }
}

/// Source of truth for the work tied to an Operation
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusProvider: Send + Sync {
    /// Report the current status of `op`'s work
    async fn probe(&self, op: &Operation) -> Result<ProbeStatus>;
}

// =============================================================================
// Static provider
// =============================================================================

/// Scripted answer of a [`StaticStatusProvider`]
#[derive(Clone, Debug)]
pub enum StaticResponse {
    /// Return this status
    Status(ProbeStatus),
    /// Fail with a retryable error carrying this message
    Transient(String),
    /// Fail with a non-retryable error carrying this message
    Permanent(String),
}

/// In-memory provider answering from a per-Operation script
///
/// Each probe pops the next scripted response for the Operation's internal
/// ID; once the script is empty the default status is returned.
pub struct StaticStatusProvider {
    default: ProbeStatus,
    scripts: Mutex<HashMap<String, VecDeque<StaticResponse>>>,
    probes: Mutex<HashMap<String, usize>>,
}

impl StaticStatusProvider {
    /// Provider answering `default` for every unscripted probe
    pub fn new(default: ProbeStatus) -> Self {
        Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a response for the Operation with `internal_id`
    pub fn push(&self, internal_id: impl Into<String>, response: StaticResponse) {
        self.scripts
            .lock()
            .entry(internal_id.into())
            .or_default()
            .push_back(response);
    }

    /// How many times the Operation with `internal_id` has been probed
    pub fn probes(&self, internal_id: &str) -> usize {
        self.probes.lock().get(internal_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl StatusProvider for StaticStatusProvider {
    async fn probe(&self, op: &Operation) -> Result<ProbeStatus> {
        let id = &op.spec.internal_id;
        *self.probes.lock().entry(id.clone()).or_insert(0) += 1;

        let next = self.scripts.lock().get_mut(id).and_then(VecDeque::pop_front);
        match next {
            None => Ok(self.default.clone()),
            Some(StaticResponse::Status(status)) => Ok(status),
            Some(StaticResponse::Transient(msg)) => {
                Err(Error::provider_for(op.key().to_string(), "static", msg))
            }
            Some(StaticResponse::Permanent(msg)) => {
                Err(Error::provider_permanent(op.key().to_string(), "static", msg))
            }
        }
    }
}

// =============================================================================
// HTTP provider
// =============================================================================

/// Body returned by the backend for `GET /operations/{internalId}`
#[derive(Debug, Deserialize)]
struct BackendStatus {
    state: String,
    #[serde(default)]
    details: String,
}

impl From<BackendStatus> for ProbeStatus {
    fn from(status: BackendStatus) -> Self {
        let details = status.details;
        match OperationState::from(status.state) {
            OperationState::Succeeded => Self::Succeeded { details },
            OperationState::Failed => Self::Failed { details },
            OperationState::Canceled => Self::Canceled { details },
            _ => Self::InProgress { details },
        }
    }
}

/// Provider that asks a backend over HTTP
///
/// Connection failures, timeouts, 429 and 5xx responses are retryable.
/// Any other non-success status is a permanent rejection.
pub struct HttpStatusProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusProvider {
    /// Create a provider for the backend at `base_url`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_with_context("provider", e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StatusProvider for HttpStatusProvider {
    async fn probe(&self, op: &Operation) -> Result<ProbeStatus> {
        let key = op.key().to_string();
        let url = format!("{}/operations/{}", self.base_url, op.spec.internal_id);
        debug!(operation = %key, %url, "Probing backend");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::provider_for(&key, "http", e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::provider_for(
                &key,
                "http",
                format!("backend returned {status}"),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::provider_permanent(
                &key,
                "http",
                format!("backend returned {status}: {body}"),
            ));
        }

        let body: BackendStatus = response
            .json()
            .await
            .map_err(|e| Error::provider_for(&key, "http", format!("invalid response: {e}")))?;
        Ok(body.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use hcp_common::crd::OperationRequest;

    fn op(internal_id: &str) -> Operation {
        Operation::accepted(
            "aro-hcp",
            &OperationRequest::default(),
            "ext",
            internal_id,
            None,
            chrono::Utc::now(),
        )
        .unwrap()
    }

    async fn backend() -> String {
        let app = Router::new().route(
            "/operations/{id}",
            get(|Path(id): Path<String>| async move {
                match id.as_str() {
                    "done" => (
                        StatusCode::OK,
                        Json(serde_json::json!({"state": "Succeeded", "details": "ok"})),
                    ),
                    "running" => (
                        StatusCode::OK,
                        Json(serde_json::json!({"state": "Provisioning"})),
                    ),
                    "rejected" => (
                        StatusCode::BAD_REQUEST,
                        Json(serde_json::json!({"error": "invalid subnet"})),
                    ),
                    _ => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        Json(serde_json::json!({})),
                    ),
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn static_provider_replays_script_then_default() {
        let provider = StaticStatusProvider::new(ProbeStatus::succeeded());
        provider.push("op-1", StaticResponse::Status(ProbeStatus::in_progress()));
        provider.push("op-1", StaticResponse::Transient("backend down".into()));
        provider.push("op-1", StaticResponse::Permanent("invalid".into()));

        let op = op("op-1");
        assert_eq!(provider.probe(&op).await.unwrap(), ProbeStatus::in_progress());
        assert!(provider.probe(&op).await.unwrap_err().is_retryable());
        assert!(!provider.probe(&op).await.unwrap_err().is_retryable());
        assert_eq!(provider.probe(&op).await.unwrap(), ProbeStatus::succeeded());
        assert_eq!(provider.probes("op-1"), 4);
        assert_eq!(provider.probes("other"), 0);
    }

    #[test]
    fn backend_states_map_onto_probe_status() {
        let status = |state: &str| {
            ProbeStatus::from(BackendStatus {
                state: state.to_string(),
                details: String::new(),
            })
        };
        assert_eq!(status("Succeeded"), ProbeStatus::succeeded());
        assert_eq!(status("failed"), ProbeStatus::failed(""));
        assert!(matches!(status("Canceled"), ProbeStatus::Canceled { .. }));
        assert_eq!(status("Provisioning"), ProbeStatus::in_progress());
        assert_eq!(status("Warming"), ProbeStatus::in_progress());
    }

    #[tokio::test]
    async fn http_provider_classifies_backend_responses() {
        let base = backend().await;
        let provider = HttpStatusProvider::new(base, Duration::from_secs(5)).unwrap();

        assert_eq!(
            provider.probe(&op("done")).await.unwrap(),
            ProbeStatus::Succeeded {
                details: "ok".into()
            }
        );
        assert_eq!(
            provider.probe(&op("running")).await.unwrap(),
            ProbeStatus::in_progress()
        );

        let err = provider.probe(&op("rejected")).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("400"));

        let err = provider.probe(&op("flaky")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn http_provider_treats_unreachable_backend_as_transient() {
        // Nothing listens on port 9 locally
        let provider =
            HttpStatusProvider::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = provider.probe(&op("any")).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
