//! Deduplicating rate-limited work queue
//!
//! A [`WorkQueue`] hands out keys to workers with two guarantees: a key is
//! never checked out by two workers at once, and re-adds while a key is in
//! flight collapse into a single redelivery after [`WorkQueue::done`].
//! Retry timing comes from a pluggable [`RateLimiter`].

#![deny(missing_docs)]

mod metrics;
pub mod queue;
pub mod rate_limiter;

pub use queue::WorkQueue;
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter, RateLimiterConfig,
};
