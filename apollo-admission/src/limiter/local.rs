use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::AdmissionDecision;
use super::BucketKey;
use super::LimiterError;
use super::Quota;
use super::RateLimiter;

#[derive(Clone, Copy, Debug)]
struct LocalBucket {
    tokens: u64,
    reset_at: Instant,
}

/// In-process fixed-window counters.
///
/// The whole capacity comes back at once when the window ends, rather than trickling back in.
/// Buckets live in this instance's memory only: several instances sharing the traffic of one
/// identity will each grant it a full quota.
pub struct LocalRateLimiter {
    buckets: Arc<Mutex<HashMap<BucketKey, LocalBucket>>>,
    sweeper: Option<AbortHandle>,
}

impl Default for LocalRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRateLimiter {
    /// A limiter whose expired buckets are only replaced on their next use.
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sweeper: None,
        }
    }

    /// A limiter that also drops expired buckets every `interval`.
    ///
    /// Must be called from within a tokio runtime. The sweeping task stops when the limiter is
    /// dropped.
    pub fn with_sweeper(interval: Duration) -> Self {
        let buckets: Arc<Mutex<HashMap<BucketKey, LocalBucket>>> = Default::default();
        let weak_buckets = Arc::downgrade(&buckets);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(buckets) = weak_buckets.upgrade() else {
                    break;
                };
                let now = Instant::now();
                let mut buckets = buckets.lock();
                let before = buckets.len();
                buckets.retain(|_, bucket| bucket.reset_at > now);
                tracing::trace!(
                    removed = before - buckets.len(),
                    remaining = buckets.len(),
                    "swept expired local buckets"
                );
            }
        });

        Self {
            buckets,
            sweeper: Some(task.abort_handle()),
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl Drop for LocalRateLimiter {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn take(
        &self,
        key: &BucketKey,
        cost: u64,
        quota: Quota,
    ) -> Result<AdmissionDecision, LimiterError> {
        let now = Instant::now();
        let hard_deny = cost > quota.capacity;
        let mut buckets = self.buckets.lock();

        if let Some(bucket) = buckets.get_mut(key).filter(|bucket| now < bucket.reset_at) {
            if bucket.tokens < cost {
                return Ok(AdmissionDecision::Denied {
                    retry_after: bucket.reset_at - now,
                    hard_deny,
                });
            }
            bucket.tokens -= cost;
            return Ok(AdmissionDecision::Allowed {
                remaining: bucket.tokens as f64,
            });
        }

        // A fresh window the caller cannot afford is not stored, so it does not start the window
        // for the next caller.
        if hard_deny {
            return Ok(AdmissionDecision::Denied {
                retry_after: quota.window,
                hard_deny,
            });
        }

        let tokens = quota.capacity - cost;
        buckets.insert(
            key.clone(),
            LocalBucket {
                tokens,
                reset_at: now + quota.window,
            },
        );
        Ok(AdmissionDecision::Allowed {
            remaining: tokens as f64,
        })
    }
}
