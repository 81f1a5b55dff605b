//! In-process Operation store
//!
//! Serves as both the authoritative store and the cache: reads see every
//! write immediately, and the initial sync barrier is always satisfied.
//! Creates behave like a status subresource: `status` is dropped from the
//! create and written in a second, separately versioned update.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::RwLock;
use tracing::debug;

use hcp_common::crd::{Operation, OperationStatus};
use hcp_common::{Error, ObjectKey, Result};

use super::{
    write_initial_status, Change, ChangeFanout, ChangeStream, OperationCache, OperationStore,
};

/// Operations held in memory, with Kubernetes-like resource versions
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<ObjectKey, Arc<Operation>>>,
    last_version: AtomicU64,
    fanout: ChangeFanout,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a record, notifying subscribers
    pub fn delete(&self, key: &ObjectKey) -> Result<()> {
        let removed = self
            .records
            .write()
            .remove(key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        self.fanout.publish(Change::deleted(&removed));
        Ok(())
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_version(&self) -> String {
        (self.last_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn create(&self, mut op: Operation) -> Result<Operation> {
        let key = op.key();
        let status = op.status.take();
        if key.namespace.is_empty() {
            return Err(Error::validation_for_field(
                key.to_string(),
                "metadata.namespace",
                "Operations are namespaced",
            ));
        }

        let created = {
            let mut records = self.records.write();
            if records.contains_key(&key) {
                return Err(Error::conflict(key.to_string(), "already exists"));
            }
            op.metadata.resource_version = Some(self.next_version());
            op.metadata.generation = Some(1);
            op.metadata.creation_timestamp = Some(Time(Utc::now()));
            let op = Arc::new(op);
            records.insert(key.clone(), Arc::clone(&op));
            op
        };

        debug!(operation = %key, "Created operation");
        self.fanout.publish(Change::applied(&created));

        let created = (*created).clone();
        match status {
            Some(status) => write_initial_status(self, created, status).await,
            None => Ok(created),
        }
    }

    async fn get(&self, key: &ObjectKey) -> Result<Operation> {
        self.records
            .read()
            .get(key)
            .map(|op| (**op).clone())
            .ok_or_else(|| Error::not_found(key.to_string()))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Operation>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|op| namespace.is_empty() || op.key().namespace == namespace)
            .map(|op| (**op).clone())
            .collect())
    }

    async fn update_status(
        &self,
        key: &ObjectKey,
        status: OperationStatus,
        resource_version: Option<String>,
    ) -> Result<Operation> {
        let updated = {
            let mut records = self.records.write();
            let current = records
                .get(key)
                .ok_or_else(|| Error::not_found(key.to_string()))?;

            if let Some(expected) = resource_version {
                if current.metadata.resource_version.as_deref() != Some(expected.as_str()) {
                    return Err(Error::conflict(
                        key.to_string(),
                        format!(
                            "resource version {} is stale (current {})",
                            expected,
                            current.metadata.resource_version.as_deref().unwrap_or("")
                        ),
                    ));
                }
            }

            let mut op = (**current).clone();
            op.status = Some(status);
            op.metadata.resource_version = Some(self.next_version());
            let op = Arc::new(op);
            records.insert(key.clone(), Arc::clone(&op));
            op
        };

        self.fanout.publish(Change::applied(&updated));
        Ok((*updated).clone())
    }
}

#[async_trait]
impl OperationCache for MemoryStore {
    fn subscribe(&self) -> ChangeStream {
        self.fanout.subscribe()
    }

    fn get_cached(&self, key: &ObjectKey) -> Option<Arc<Operation>> {
        self.records.read().get(key).cloned()
    }

    fn keys(&self) -> Vec<ObjectKey> {
        self.records.read().keys().cloned().collect()
    }

    async fn wait_for_sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeKind;
    use futures::StreamExt;
    use hcp_common::crd::{OperationRequest, OperationState};

    fn op(name: &str) -> Operation {
        Operation::accepted(
            "aro-hcp",
            &OperationRequest::default(),
            "ext",
            name,
            None,
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_assigns_version_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let created = store.create(op("op-1")).await.unwrap();
        // One version for the create, one for the status write
        assert_eq!(created.metadata.resource_version.as_deref(), Some("2"));
        assert_eq!(created.metadata.generation, Some(1));
        assert!(created.metadata.creation_timestamp.is_some());

        let err = store.create(op("op-1")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn create_writes_status_separately_from_the_object() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();

        let created = store.create(op("op-1")).await.unwrap();
        let status = created.status.as_ref().expect("create returns the written status");
        assert_eq!(status.state, OperationState::Accepted);
        assert!(!status.terminal);
        assert!(status.last_modified_time.is_some());
        let stored = store.get(&created.key()).await.unwrap();
        assert_eq!(stored.metadata.resource_version, created.metadata.resource_version);
        assert_eq!(stored.status, created.status);

        // The create itself carries no status, as with a status subresource
        let first = changes.next().await.unwrap();
        assert_eq!(first.kind, ChangeKind::Applied);
        let second = changes.next().await.unwrap();
        assert_eq!(second.generation, first.generation);

        let mut bare = op("op-2");
        bare.status = None;
        let created = store.create(bare).await.unwrap();
        assert!(created.status.is_none());
        assert_eq!(created.metadata.resource_version.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn update_status_is_compare_and_write() {
        let store = MemoryStore::new();
        let created = store.create(op("op-1")).await.unwrap();
        let key = created.key();

        let status = OperationStatus {
            state: OperationState::Provisioning,
            ..Default::default()
        };
        let updated = store
            .update_status(&key, status.clone(), created.metadata.resource_version.clone())
            .await
            .unwrap();
        assert_eq!(updated.state(), OperationState::Provisioning);
        assert_eq!(updated.metadata.generation, Some(1), "status writes keep generation");

        // The version we read before the update is now stale
        let err = store
            .update_status(&key, status.clone(), created.metadata.resource_version.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(err.is_retryable());

        // Unconditional writes always land
        store.update_status(&key, status, None).await.unwrap();
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let store = MemoryStore::new();
        let key = ObjectKey::new("aro-hcp", "missing");
        assert!(store.get(&key).await.unwrap_err().is_not_found());
        assert!(store
            .update_status(&key, OperationStatus::default(), None)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store.get_cached(&key).is_none());
    }

    #[tokio::test]
    async fn list_filters_by_namespace() {
        let store = MemoryStore::new();
        store.create(op("op-1")).await.unwrap();
        let mut other = op("op-2");
        other.metadata.namespace = Some("elsewhere".into());
        store.create(other).await.unwrap();

        assert_eq!(store.list("aro-hcp").await.unwrap().len(), 1);
        assert_eq!(store.list("").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_every_change() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();

        let created = store.create(op("op-1")).await.unwrap();
        store
            .update_status(&created.key(), OperationStatus::default(), None)
            .await
            .unwrap();
        store.delete(&created.key()).unwrap();

        let kinds: Vec<_> = changes.by_ref().take(4).map(|c| c.kind).collect().await;
        assert_eq!(
            kinds,
            vec![
                ChangeKind::Applied,
                ChangeKind::Applied,
                ChangeKind::Applied,
                ChangeKind::Deleted
            ]
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cache_view_reflects_writes() {
        let store = MemoryStore::new();
        store.wait_for_sync().await.unwrap();
        let created = store.create(op("op-1")).await.unwrap();

        assert_eq!(store.keys(), vec![created.key()]);
        let cached = store.get_cached(&created.key()).unwrap();
        assert_eq!(cached.spec.internal_id, "op-1");
    }
}
