//! Operation store and cache backed by the Kubernetes API
//!
//! Status writes go through the status subresource with a merge patch that
//! carries `metadata.resourceVersion`, so the API server rejects stale writes
//! with 409. The cache is a kube-runtime reflector.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hcp_common::crd::{Operation, OperationStatus};
use hcp_common::{Error, ObjectKey, Result};

use super::{
    write_initial_status, Change, ChangeFanout, ChangeStream, OperationCache, OperationStore,
};

/// Server-side watch timeout, kept below the client's 30s read timeout so idle
/// watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Authoritative Operation store on the Kubernetes API
#[derive(Clone)]
pub struct KubeOperationStore {
    client: Client,
}

impl KubeOperationStore {
    /// Create a store using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Operation> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

/// Map API conflicts and missing objects onto the store's error taxonomy
fn classify(key: &ObjectKey, err: kube::Error) -> Error {
    if let kube::Error::Api(ae) = &err {
        match ae.code {
            409 => return Error::conflict(key.to_string(), ae.message.clone()),
            404 => return Error::not_found(key.to_string()),
            _ => {}
        }
    }
    Error::from(err)
}

#[async_trait]
impl OperationStore for KubeOperationStore {
    async fn create(&self, op: Operation) -> Result<Operation> {
        let key = op.key();
        let created = self
            .api(&key.namespace)
            .create(&PostParams::default(), &op)
            .await
            .map_err(|e| classify(&key, e))?;

        match op.status {
            Some(status) => write_initial_status(self, created, status).await,
            None => Ok(created),
        }
    }

    async fn get(&self, key: &ObjectKey) -> Result<Operation> {
        self.api(&key.namespace)
            .get_opt(&key.name)
            .await?
            .ok_or_else(|| Error::not_found(key.to_string()))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Operation>> {
        Ok(self
            .api(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn update_status(
        &self,
        key: &ObjectKey,
        status: OperationStatus,
        resource_version: Option<String>,
    ) -> Result<Operation> {
        let mut patch = json!({ "status": status });
        if let Some(rv) = resource_version {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }

        self.api(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| classify(key, e))
    }
}

/// Reflector-backed cache of Operations
///
/// Holds the reader half; the watch runs on a background task until the
/// cancellation token fires.
pub struct KubeOperationCache {
    reader: Store<Operation>,
    fanout: Arc<ChangeFanout>,
}

impl KubeOperationCache {
    /// Start watching Operations in `namespace` (all namespaces when empty)
    pub fn spawn(client: Client, namespace: &str, cancel: CancellationToken) -> Self {
        let api: Api<Operation> = if namespace.is_empty() {
            Api::all(client)
        } else {
            Api::namespaced(client, namespace)
        };

        let (reader, writer) = reflector::store();
        let fanout = Arc::new(ChangeFanout::default());

        let stream = watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
            .default_backoff()
            .reflect(writer);

        let task_fanout = Arc::clone(&fanout);
        tokio::spawn(async move {
            tokio::pin!(stream);
            info!("Starting operation watch");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(Ok(watcher::Event::Apply(op))) | Some(Ok(watcher::Event::InitApply(op))) => {
                            task_fanout.publish(Change::applied(&op));
                        }
                        Some(Ok(watcher::Event::Delete(op))) => {
                            task_fanout.publish(Change::deleted(&op));
                        }
                        Some(Ok(watcher::Event::Init)) => debug!("Operation relist started"),
                        Some(Ok(watcher::Event::InitDone)) => debug!("Operation relist complete"),
                        Some(Err(e)) => warn!(error = %e, "Operation watch error, backing off"),
                        None => break,
                    },
                }
            }
            info!("Operation watch stopped");
        });

        Self { reader, fanout }
    }
}

#[async_trait]
impl OperationCache for KubeOperationCache {
    fn subscribe(&self) -> ChangeStream {
        self.fanout.subscribe()
    }

    fn get_cached(&self, key: &ObjectKey) -> Option<Arc<Operation>> {
        self.reader
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
    }

    fn keys(&self) -> Vec<ObjectKey> {
        self.reader.state().iter().map(|op| op.key()).collect()
    }

    async fn wait_for_sync(&self) -> Result<()> {
        self.reader
            .wait_until_ready()
            .await
            .map_err(|e| Error::internal_with_context("cache", e.to_string()))
    }
}
