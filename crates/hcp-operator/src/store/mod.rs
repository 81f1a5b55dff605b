//! Operation storage seams
//!
//! The reconciler reads through an [`OperationCache`] (a local, watch-fed view)
//! and writes through an [`OperationStore`] (the authoritative path with
//! compare-and-write on status). Both have an in-memory implementation and a
//! Kubernetes implementation.

mod kubernetes;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use hcp_common::crd::{Operation, OperationStatus};
use hcp_common::{Error, ObjectKey, Result};

#[cfg(test)]
use mockall::automock;

pub use kubernetes::{KubeOperationCache, KubeOperationStore};
pub use memory::MemoryStore;

/// What happened to a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created or modified
    Applied,
    /// Removed from the store
    Deleted,
}

/// A change notification from the cache
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    /// Record identity
    pub key: ObjectKey,
    /// Kind of change
    pub kind: ChangeKind,
    /// `metadata.generation` after the change; unchanged by status writes
    pub generation: Option<i64>,
}

impl Change {
    /// Describe `op` as applied
    pub fn applied(op: &Operation) -> Self {
        Self {
            key: op.key(),
            kind: ChangeKind::Applied,
            generation: op.metadata.generation,
        }
    }

    /// Describe `op` as deleted
    pub fn deleted(op: &Operation) -> Self {
        Self {
            key: op.key(),
            kind: ChangeKind::Deleted,
            generation: op.metadata.generation,
        }
    }
}

/// Stream of changes handed out by [`OperationCache::subscribe`]
pub type ChangeStream = BoxStream<'static, Change>;

/// Authoritative write path for Operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Create a new Operation; fails with `Conflict` if the name is taken
    async fn create(&self, op: Operation) -> Result<Operation>;

    /// Fetch the current record
    async fn get(&self, key: &ObjectKey) -> Result<Operation>;

    /// All records in `namespace`, or everywhere when empty
    async fn list(&self, namespace: &str) -> Result<Vec<Operation>>;

    /// Replace the status of `key`
    ///
    /// When `resource_version` is set, the write only succeeds if the record
    /// still has that version; otherwise it fails with `Conflict`.
    async fn update_status(
        &self,
        key: &ObjectKey,
        status: OperationStatus,
        resource_version: Option<String>,
    ) -> Result<Operation>;
}

/// Local read view of Operations, fed by the store's change stream
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OperationCache: Send + Sync {
    /// Receive every change applied to the view from now on
    fn subscribe(&self) -> ChangeStream;

    /// Cached copy of `key`, if present
    fn get_cached(&self, key: &ObjectKey) -> Option<Arc<Operation>>;

    /// Every key currently in the view
    fn keys(&self) -> Vec<ObjectKey>;

    /// Resolve once the view holds a full initial listing
    async fn wait_for_sync(&self) -> Result<()>;
}

/// Write the status a caller supplied on create
///
/// The status subresource ignores `status` in a create, so it is written
/// separately. If the reconciler got there first, its status is kept.
pub(crate) async fn write_initial_status<S>(
    store: &S,
    created: Operation,
    status: OperationStatus,
) -> Result<Operation>
where
    S: OperationStore + ?Sized,
{
    let key = created.key();
    match store
        .update_status(&key, status, created.metadata.resource_version.clone())
        .await
    {
        Err(Error::Conflict { .. }) => store.get(&key).await,
        other => other,
    }
}

/// Fans changes out to any number of subscribers
#[derive(Default)]
pub(crate) struct ChangeFanout {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Change>>>,
}

impl ChangeFanout {
    pub(crate) fn subscribe(&self) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    pub(crate) fn publish(&self, change: Change) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}
