use std::time::Duration;

use async_trait::async_trait;
use fred::types::scripts::Script;

use super::AdmissionDecision;
use super::BucketKey;
use super::LimiterError;
use super::Quota;
use super::RateLimiter;
use crate::configuration::RedisConfig;
use crate::redis::RedisStorage;
use crate::redis::record;

const TOKEN_BUCKET_SCRIPT: &str = include_str!("token_bucket.lua");

/// Continuously refilling buckets stored in Redis.
///
/// The whole read, refill, spend and write cycle runs as one Lua script, so any number of
/// instances can share a bucket without coordinating. Time is read from the Redis server, never
/// from the calling instance.
#[derive(Clone)]
pub struct RedisRateLimiter {
    storage: RedisStorage,
    script: Script,
}

impl RedisRateLimiter {
    pub async fn new(config: &RedisConfig) -> Result<Self, LimiterError> {
        let storage = RedisStorage::new(config).await?;
        Ok(Self::from_storage(storage))
    }

    pub(crate) fn from_storage(storage: RedisStorage) -> Self {
        Self {
            storage,
            script: Script::from_lua(TOKEN_BUCKET_SCRIPT),
        }
    }
}

fn to_arg(value: u128) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn take(
        &self,
        key: &BucketKey,
        cost: u64,
        quota: Quota,
    ) -> Result<AdmissionDecision, LimiterError> {
        let window_ms = to_arg(quota.window.as_millis()).max(1);
        let args = vec![
            to_arg(cost.into()),
            to_arg(quota.capacity.into()),
            window_ms,
        ];

        let (allowed, tokens, retry_after_ms, hard_deny): (i64, String, i64, i64) = self
            .storage
            .eval_script(&self.script, key.as_str(), args)
            .await
            .inspect_err(|error| record(error, "admission"))?;

        if hard_deny == 1 {
            return Ok(AdmissionDecision::Denied {
                retry_after: Duration::from_millis(retry_after_ms.max(0) as u64),
                hard_deny: true,
            });
        }
        if allowed == 1 {
            let remaining = tokens.parse::<f64>().map_err(|_| {
                LimiterError::UnexpectedReply(format!("token balance is not a number: {tokens}"))
            })?;
            return Ok(AdmissionDecision::Allowed { remaining });
        }

        Ok(AdmissionDecision::Denied {
            retry_after: Duration::from_millis(retry_after_ms.max(0) as u64),
            hard_deny: false,
        })
    }
}
