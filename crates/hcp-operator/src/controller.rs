//! Operation controller
//!
//! Change notifications and periodic resyncs feed keys into a
//! [`WorkQueue`]; a fixed pool of workers drains it, running
//! [`sync_operation`] for each key. Workers start only after the cache has
//! completed its initial sync.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hcp_common::events::EventPublisher;
use hcp_common::metrics::{SyncResult, SyncTimer};
use hcp_common::{Error, ObjectKey, Result};
use hcp_workqueue::{RateLimiterConfig, WorkQueue};

use crate::provider::StatusProvider;
use crate::store::{ChangeKind, ChangeStream, OperationCache, OperationStore};
use crate::sync::{sync_operation, SyncOutcome};

/// Collaborators shared by every worker
pub struct Context {
    /// Authoritative write path
    pub store: Arc<dyn OperationStore>,
    /// Local read view
    pub cache: Arc<dyn OperationCache>,
    /// Source of real-world status
    pub provider: Arc<dyn StatusProvider>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Bundle the collaborators
    pub fn new(
        store: Arc<dyn OperationStore>,
        cache: Arc<dyn OperationCache>,
        provider: Arc<dyn StatusProvider>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            cache,
            provider,
            events,
        }
    }
}

/// Controller tunables
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of parallel workers
    pub workers: usize,
    /// Retry policy for the queue
    pub rate_limiter: RateLimiterConfig,
    /// Re-enqueue every pending key at this interval
    pub resync_interval: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            rate_limiter: RateLimiterConfig::default(),
            resync_interval: None,
        }
    }
}

/// Drives Operations to a terminal state
pub struct Controller {
    ctx: Arc<Context>,
    config: ControllerConfig,
    queue: WorkQueue<String>,
}

impl Controller {
    /// Create a controller; nothing runs until [`Controller::run`]
    pub fn new(ctx: Context, config: ControllerConfig) -> Self {
        let queue = WorkQueue::new("operations", config.rate_limiter.build());
        Self {
            ctx: Arc::new(ctx),
            config,
            queue,
        }
    }

    /// Handle to the controller's queue
    pub fn queue(&self) -> WorkQueue<String> {
        self.queue.clone()
    }

    /// Run until `cancel` fires
    ///
    /// Returns an error only if cancelled before the cache synced or if the
    /// cache failed to sync. In-flight items are allowed to finish.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Controller { ctx, config, queue } = self;
        let mut background = JoinSet::new();
        let filter = GenerationFilter::default();

        background.spawn(handle_changes(
            ctx.cache.subscribe(),
            queue.clone(),
            filter.clone(),
            cancel.clone(),
        ));

        info!("Waiting for operation cache to sync");
        let synced = tokio::select! {
            res = ctx.cache.wait_for_sync() => res,
            _ = cancel.cancelled() => Err(Error::internal_with_context(
                "controller",
                "cancelled before cache sync",
            )),
        };
        if let Err(e) = synced {
            queue.shut_down();
            cancel.cancel();
            background.shutdown().await;
            return Err(e);
        }

        let count = enqueue_unseen(ctx.cache.as_ref(), &queue, &filter);
        debug!(count, "Enqueued pending operations after sync");

        if let Some(interval) = config.resync_interval {
            background.spawn(resync(
                Arc::clone(&ctx.cache),
                queue.clone(),
                interval,
                cancel.clone(),
            ));
        }

        info!(workers = config.workers, "Starting operation workers");
        let mut workers = JoinSet::new();
        for id in 0..config.workers.max(1) {
            workers.spawn(run_worker(
                id,
                Arc::clone(&ctx),
                queue.clone(),
                cancel.clone(),
            ));
        }

        cancel.cancelled().await;
        info!("Shutting down operation workers");
        queue.shut_down_with_drain().await;

        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "Worker task failed");
            }
        }
        while background.join_next().await.is_some() {}

        info!("Operation controller stopped");
        Ok(())
    }
}

/// Enqueue keys whose record is not yet terminal
fn enqueue_pending(cache: &dyn OperationCache, queue: &WorkQueue<String>) -> usize {
    let mut count = 0;
    for key in cache.keys() {
        if cache.get_cached(&key).is_some_and(|op| !op.is_terminal()) {
            queue.add(key.to_string());
            count += 1;
        }
    }
    count
}

/// Last generation enqueued for each key
///
/// Shared by the change handler and the post-sync enqueue so a key reaches
/// the queue once per generation, whichever path sees it first.
#[derive(Clone, Default)]
struct GenerationFilter {
    seen: Arc<Mutex<HashMap<ObjectKey, Option<i64>>>>,
}

impl GenerationFilter {
    /// Record `generation` for `key`; true if it differs from the last one
    fn observe(&self, key: &ObjectKey, generation: Option<i64>) -> bool {
        self.seen.lock().insert(key.clone(), generation) != Some(generation)
    }

    fn forget(&self, key: &ObjectKey) {
        self.seen.lock().remove(key);
    }
}

/// Enqueue non-terminal keys whose generation has not been enqueued yet
fn enqueue_unseen(
    cache: &dyn OperationCache,
    queue: &WorkQueue<String>,
    filter: &GenerationFilter,
) -> usize {
    let mut count = 0;
    for key in cache.keys() {
        let Some(op) = cache.get_cached(&key) else {
            continue;
        };
        if !op.is_terminal() && filter.observe(&key, op.metadata.generation) {
            queue.add(key.to_string());
            count += 1;
        }
    }
    count
}

/// Turn change notifications into queue adds
///
/// Status writes do not bump `generation`, so only creations and spec changes
/// enqueue; progress polling stays on the rate-limited path.
async fn handle_changes(
    mut changes: ChangeStream,
    queue: WorkQueue<String>,
    filter: GenerationFilter,
    cancel: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.next() => match change {
                Some(change) => change,
                None => break,
            },
        };

        match change.kind {
            ChangeKind::Applied => {
                if filter.observe(&change.key, change.generation) {
                    debug!(operation = %change.key, "Enqueueing changed operation");
                    queue.add(change.key.to_string());
                }
            }
            ChangeKind::Deleted => filter.forget(&change.key),
        }
    }
    debug!("Change handler stopped");
}

async fn resync(
    cache: Arc<dyn OperationCache>,
    queue: WorkQueue<String>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately and startup already enqueued everything
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let count = enqueue_pending(cache.as_ref(), &queue);
                debug!(count, "Resync enqueued pending operations");
            }
        }
    }
}

async fn run_worker(
    id: usize,
    ctx: Arc<Context>,
    queue: WorkQueue<String>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "Worker started");
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = queue.get() => match item {
                Some(item) => item,
                None => break,
            },
        };
        process_next_work_item(&ctx, &queue, item).await;
    }
    debug!(worker = id, "Worker stopped");
}

/// Sync one checked-out item and decide its fate
///
/// `done` is called exactly once, whatever the sync does, including panicking.
pub async fn process_next_work_item(ctx: &Context, queue: &WorkQueue<String>, item: String) {
    let timer = SyncTimer::start();

    let result = match item.parse::<ObjectKey>() {
        Ok(key) => {
            match AssertUnwindSafe(sync_operation(ctx, &key))
                .catch_unwind()
                .await
            {
                Ok(Ok(SyncOutcome::Done)) => {
                    queue.forget(&item);
                    SyncResult::Done
                }
                Ok(Ok(SyncOutcome::Requeue)) => {
                    queue.add_rate_limited(item.clone());
                    SyncResult::Requeue
                }
                Ok(Err(e)) => {
                    let requeues = queue.num_requeues(&item);
                    if e.is_retryable() {
                        warn!(
                            operation = %key,
                            error = %e,
                            requeues,
                            "Error syncing operation, requeuing"
                        );
                    } else {
                        error!(
                            operation = %key,
                            error = %e,
                            requeues,
                            "Error syncing operation, requeuing"
                        );
                    }
                    queue.add_rate_limited(item.clone());
                    SyncResult::Error
                }
                Err(panic) => {
                    error!(
                        operation = %key,
                        panic = %panic_message(panic.as_ref()),
                        "Sync panicked, requeuing"
                    );
                    queue.add_rate_limited(item.clone());
                    SyncResult::Panic
                }
            }
        }
        Err(e) => {
            // Retrying cannot fix a malformed key
            error!(item = %item, error = %e, "Dropping invalid queue item");
            queue.forget(&item);
            SyncResult::Done
        }
    };

    queue.done(&item);
    timer.finish(result);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
