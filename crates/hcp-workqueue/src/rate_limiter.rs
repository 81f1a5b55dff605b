//! Retry delay policies for the work queue
//!
//! The default controller policy combines a per-key exponential backoff with a
//! global token bucket and uses whichever asks for the longer wait.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Decides how long an item should wait before it is redelivered
pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be processed again; records one more failure
    fn when(&self, item: &T) -> Duration;

    /// Stop tracking `item`, resetting its failure count
    fn forget(&self, item: &T);

    /// Number of failures recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &T) -> u32;
}

/// Tunables for [`default_controller_rate_limiter`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Backoff after the first failure
    pub base_delay: Duration,
    /// Ceiling for per-key backoff
    pub max_delay: Duration,
    /// Sustained redeliveries per second across all keys
    pub qps: u32,
    /// Redeliveries allowed in a burst before `qps` applies
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 50,
            burst: 300,
        }
    }
}

impl RateLimiterConfig {
    /// Build the combined per-key and global limiter
    pub fn build<T>(&self) -> MaxOfRateLimiter<T>
    where
        T: Clone + Eq + Hash + Send + Sync + 'static,
    {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                self.base_delay,
                self.max_delay,
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

/// Exponential per-key backoff (5ms base, 1000s cap) combined with a 50 qps,
/// 300 burst token bucket
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    RateLimiterConfig::default().build()
}

// =============================================================================
// Per-item exponential backoff
// =============================================================================

/// Waits `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter<T> {
    failures: Mutex<HashMap<T, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T: Clone + Eq + Hash> ItemExponentialFailureRateLimiter<T> {
    /// Create a limiter with the given base and ceiling
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }
}

impl<T: Clone + Eq + Hash + Send + Sync> RateLimiter<T> for ItemExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exp)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

// =============================================================================
// Global token bucket
// =============================================================================

/// Token bucket shared by all items
///
/// Every call reserves a token, so callers beyond the burst are spaced
/// `1/qps` apart into the future rather than rejected.
pub struct BucketRateLimiter {
    interval: Duration,
    window: Duration,
    theoretical_arrival: Mutex<Option<Instant>>,
}

impl BucketRateLimiter {
    /// Create a bucket refilling at `qps` tokens per second holding up to `burst`
    pub fn new(qps: u32, burst: u32) -> Self {
        let interval = Duration::from_secs(1) / qps.max(1);
        Self {
            interval,
            window: interval * burst.max(1),
            theoretical_arrival: Mutex::new(None),
        }
    }

    fn reserve(&self) -> Duration {
        let now = Instant::now();
        let mut tat = self.theoretical_arrival.lock();
        let start = match *tat {
            Some(t) if t > now => t,
            _ => now,
        };
        let next = start + self.interval;
        *tat = Some(next);
        next.duration_since(now).saturating_sub(self.window)
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

// =============================================================================
// Composition
// =============================================================================

/// Asks every inner limiter and returns the longest delay
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    /// Combine the given limiters
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        // Every limiter must observe the failure, so no short-circuit.
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn exponential_doubles_per_failure_until_cap() {
        let limiter = ItemExponentialFailureRateLimiter::new(ms(5), ms(40));
        let delays: Vec<_> = (0..6).map(|_| limiter.when(&"a")).collect();
        assert_eq!(delays, vec![ms(5), ms(10), ms(20), ms(40), ms(40), ms(40)]);
        assert_eq!(limiter.num_requeues(&"a"), 6);
    }

    #[test]
    fn exponential_tracks_items_independently() {
        let limiter = ItemExponentialFailureRateLimiter::new(ms(1), Duration::from_secs(1));
        limiter.when(&"a");
        limiter.when(&"a");
        assert_eq!(limiter.when(&"b"), ms(1));
        assert_eq!(limiter.num_requeues(&"a"), 2);
        assert_eq!(limiter.num_requeues(&"b"), 1);
    }

    #[test]
    fn forget_resets_backoff() {
        let limiter = ItemExponentialFailureRateLimiter::new(ms(5), Duration::from_secs(1));
        limiter.when(&"a");
        limiter.when(&"a");
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), ms(5));
    }

    #[test]
    fn huge_failure_counts_saturate_at_max() {
        let limiter = ItemExponentialFailureRateLimiter::new(ms(5), Duration::from_secs(1000));
        let mut last = Duration::ZERO;
        for _ in 0..100 {
            let delay = limiter.when(&"a");
            assert!(delay >= last, "backoff must never shrink");
            last = delay;
        }
        assert_eq!(last, Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_by_qps() {
        let bucket = BucketRateLimiter::new(10, 2);
        let delays: Vec<_> = (0..5).map(|_| RateLimiter::<&str>::when(&bucket, &"x")).collect();
        assert_eq!(
            delays,
            vec![Duration::ZERO, Duration::ZERO, ms(100), ms(200), ms(300)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let bucket = BucketRateLimiter::new(10, 1);
        assert_eq!(RateLimiter::<&str>::when(&bucket, &"x"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&bucket, &"x"), ms(100));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(RateLimiter::<&str>::when(&bucket, &"x"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn max_of_takes_the_longer_delay() {
        let limiter: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(ms(5), Duration::from_secs(1))),
            Box::new(BucketRateLimiter::new(10, 1)),
        ]);

        // First call: bucket has a token, exponential says 5ms
        assert_eq!(limiter.when(&"a"), ms(5));
        // Second call: bucket is empty, so its 100ms wins over 10ms
        assert_eq!(limiter.when(&"a"), ms(100));
        assert_eq!(limiter.num_requeues(&"a"), 2);

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn default_limiter_starts_at_five_millis() {
        let limiter = default_controller_rate_limiter::<String>();
        assert_eq!(limiter.when(&"ns/op".to_string()), ms(5));
        assert_eq!(limiter.when(&"ns/op".to_string()), ms(10));
    }
}
