//! Token buckets spending operation cost against a per-identity quota.
//!
//! Two variants implement [`RateLimiter`], selected by deployment topology:
//!
//! * [`LocalRateLimiter`] keeps fixed-window counters in process memory. It is only correct when a
//!   single instance sees all the traffic of an identity.
//! * [`RedisRateLimiter`] runs a continuously refilling bucket as one atomic script inside Redis,
//!   and is correct across any number of instances sharing the same Redis.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use displaydoc::Display;
use thiserror::Error;

mod local;
mod redis;

pub use self::local::LocalRateLimiter;
pub use self::redis::RedisRateLimiter;

/// Identity key a bucket is stored under, such as `user:42` or `ip:10.0.0.1`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Size of a bucket and how long it takes to refill from empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quota {
    pub capacity: u64,
    pub window: Duration,
}

impl Quota {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self { capacity, window }
    }
}

/// Outcome of spending tokens from a bucket.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AdmissionDecision {
    Allowed {
        /// Tokens left after the spend.
        remaining: f64,
    },
    Denied {
        retry_after: Duration,
        /// The cost is larger than the whole bucket: waiting will never help.
        hard_deny: bool,
    },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed { .. })
    }
}

/// Errors from the bucket store. The local limiter never fails.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum LimiterError {
    /// redis: {0}
    Redis(#[from] crate::redis::Error),
    /// unexpected reply from the bucket script: {0}
    UnexpectedReply(String),
}

/// Spends operation cost from the bucket of one identity.
#[async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    /// Try to take `cost` tokens from the bucket stored under `key`.
    ///
    /// A denial is a normal outcome. `Err` means the bucket store could not be consulted.
    async fn take(
        &self,
        key: &BucketKey,
        cost: u64,
        quota: Quota,
    ) -> Result<AdmissionDecision, LimiterError>;
}
