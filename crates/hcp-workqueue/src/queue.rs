//! The work queue
//!
//! Items move through three sets:
//! - `dirty`: needs processing (queued, or re-added while in flight)
//! - `processing`: checked out by a worker
//! - `waiting`: scheduled to be added at a future deadline
//!
//! An item is in the ready queue only when it is dirty and not processing,
//! which is what keeps a key from being handed to two workers at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::metrics;
use crate::rate_limiter::RateLimiter;

/// Deduplicating, rate-limited queue of keys
///
/// Cloning is cheap and yields a handle to the same queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    /// Signalled when an item becomes ready or on shutdown
    available: Notify,
    /// Signalled when the last checked-out item is released
    idle: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    waiting: HashMap<T, Instant>,
    shutting_down: bool,
}

impl<T: Clone + Eq + Hash> State<T> {
    /// Mark `item` dirty; returns true when it was pushed to the ready queue
    fn insert(&mut self, item: T) -> bool {
        if !self.dirty.insert(item.clone()) {
            return false;
        }
        if self.processing.contains(&item) {
            return false;
        }
        self.queue.push_back(item);
        true
    }
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue using `rate_limiter` for [`WorkQueue::add_rate_limited`]
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                idle: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    /// Mark `item` for processing
    ///
    /// No-op if it is already queued. If a worker currently holds it, it is
    /// redelivered after that worker calls [`WorkQueue::done`].
    pub fn add(&self, item: T) {
        let pushed = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            metrics::record_add(&self.inner.name);
            let pushed = state.insert(item);
            metrics::record_depth(&self.inner.name, state.queue.len());
            pushed
        };
        if pushed {
            self.inner.available.notify_one();
        }
    }

    /// Wait for the next ready item and check it out
    ///
    /// Returns `None` once the queue is shutting down. Cancel safe.
    pub async fn get(&self) -> Option<T> {
        loop {
            let available = self.inner.available.notified();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    metrics::record_depth(&self.inner.name, state.queue.len());
                    return Some(item);
                }
            }
            available.await;
        }
    }

    /// Release a checked-out item
    ///
    /// If it was re-added while checked out it becomes ready again.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(item);
            let requeue = !state.shutting_down && state.dirty.contains(item);
            if requeue {
                state.queue.push_back(item.clone());
                metrics::record_depth(&self.inner.name, state.queue.len());
            }
            if state.processing.is_empty() {
                self.inner.idle.notify_waiters();
            }
            requeue
        };
        if requeued {
            self.inner.available.notify_one();
        }
    }

    /// Add `item` once `delay` has elapsed
    ///
    /// If the item is already scheduled, the earlier deadline wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            if matches!(state.waiting.get(&item), Some(existing) if *existing <= deadline) {
                return;
            }
            state.waiting.insert(item.clone(), deadline);
        }

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire_delayed(inner, item, deadline);
        });
    }

    /// Add `item` after the delay chosen by the rate limiter
    pub fn add_rate_limited(&self, item: T) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.inner.rate_limiter.when(&item);
        metrics::record_retry(&self.inner.name);
        debug!(
            queue = %self.inner.name,
            delay_ms = delay.as_millis() as u64,
            "Scheduling rate-limited retry"
        );
        self.add_after(item, delay);
    }

    /// Reset the rate limiter's failure history for `item`
    pub fn forget(&self, item: &T) {
        self.inner.rate_limiter.forget(item);
    }

    /// Failures recorded for `item` since it was last forgotten
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.rate_limiter.num_requeues(item)
    }

    /// Number of items ready to be checked out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no items are ready
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`WorkQueue::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Stop handing out items
    ///
    /// Blocked and future [`WorkQueue::get`] calls return `None`; adds are
    /// ignored. Items already checked out may still be released with
    /// [`WorkQueue::done`].
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.available.notify_waiters();
    }

    /// Shut down, then wait until every checked-out item has been released
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.state.lock().processing.is_empty() {
                return;
            }
            idle.await;
        }
    }
}

fn fire_delayed<T>(inner: Weak<Inner<T>>, item: T, deadline: Instant)
where
    T: Clone + Eq + Hash,
{
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let pushed = {
        let mut state = inner.state.lock();
        // Superseded by an earlier deadline, or cleared by shutdown
        if state.waiting.get(&item) != Some(&deadline) {
            return;
        }
        state.waiting.remove(&item);
        metrics::record_add(&inner.name);
        let pushed = state.insert(item);
        metrics::record_depth(&inner.name, state.queue.len());
        pushed
    };
    if pushed {
        inner.available.notify_one();
    }
}
