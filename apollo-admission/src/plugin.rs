//! The admission gate run before every operation.

use std::sync::Arc;
use std::time::Duration;

use tower::BoxError;

use crate::configuration::Configuration;
use crate::configuration::FailurePolicy;
use crate::configuration::LimiterConfig;
use crate::configuration::Tiers;
use crate::cost::QueryCostExtractor;
use crate::error::AdmissionError;
use crate::error::retry_after_secs;
use crate::limiter::AdmissionDecision;
use crate::limiter::LocalRateLimiter;
use crate::limiter::Quota;
use crate::limiter::RateLimiter;
use crate::limiter::RedisRateLimiter;
use crate::services::AdmissionRequest;
use crate::services::Admitted;

/// Prices each operation and spends its cost from the caller's token bucket.
#[derive(Clone)]
pub struct AdmissionControl {
    enabled: bool,
    extractor: QueryCostExtractor,
    tiers: Tiers,
    window: Duration,
    limiter: Arc<dyn RateLimiter>,
    on_backend_error: FailurePolicy,
}

impl AdmissionControl {
    /// Build admission control with the limiter its configuration asks for.
    ///
    /// A Redis limiter that is not `required_to_start` connects in the background, and requests
    /// made before it is connected follow `on_backend_error`.
    pub async fn new(configuration: Configuration) -> Result<Self, BoxError> {
        configuration.validate()?;

        let limiter: Arc<dyn RateLimiter> = match (&configuration.limiter, configuration.enabled)
        {
            (_, false) => Arc::new(LocalRateLimiter::new()),
            (LimiterConfig::Local(local), true) => {
                tracing::info!(
                    "local admission buckets only see this instance's traffic, use the redis limiter when running several instances"
                );
                Arc::new(LocalRateLimiter::with_sweeper(
                    local.sweep_interval.unwrap_or(configuration.window),
                ))
            }
            (LimiterConfig::Redis(redis), true) => Arc::new(RedisRateLimiter::new(redis).await?),
        };

        tracing::info!(
            enabled = configuration.enabled,
            limiter = limiter_kind(&configuration.limiter),
            window = ?configuration.window,
            on_backend_error = ?configuration.on_backend_error,
            "admission control configured"
        );

        Ok(Self::with_limiter(configuration, limiter))
    }

    /// Build admission control around an existing limiter, ignoring the configured one.
    pub fn with_limiter(configuration: Configuration, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            enabled: configuration.enabled,
            extractor: QueryCostExtractor::new(
                Arc::new(configuration.costs),
                configuration.max_root_fields,
            ),
            tiers: configuration.tiers,
            window: configuration.window,
            limiter,
            on_backend_error: configuration.on_backend_error,
        }
    }

    /// Admit or refuse one request.
    ///
    /// `Ok(Some(_))` describes what the admitted request paid. `Ok(None)` means the request was
    /// let through without being billed, either because admission control is disabled or because
    /// the bucket store failed and the policy is to fail open.
    pub async fn evaluate(
        &self,
        request: &AdmissionRequest,
    ) -> Result<Option<Admitted>, AdmissionError> {
        if !self.enabled {
            return Ok(None);
        }

        let cost = self.extractor.extract(
            request.document.as_deref(),
            request.query.as_deref(),
            request.operation_name.as_deref(),
        );
        let key = request.identity.bucket_key();
        let tier = request.identity.tier();
        let quota = Quota::new(self.tiers.capacity_for(tier), self.window);

        match self.limiter.take(&key, cost.cost, quota).await {
            Ok(AdmissionDecision::Allowed { remaining }) => {
                tracing::debug!(
                    key = %key,
                    %tier,
                    operation = %cost.operation_label(),
                    cost = cost.cost,
                    remaining,
                    "request admitted"
                );
                Ok(Some(Admitted {
                    key,
                    cost: cost.cost,
                    remaining,
                    root_fields: cost.root_fields,
                }))
            }
            Ok(AdmissionDecision::Denied {
                retry_after,
                hard_deny: true,
            }) => {
                tracing::warn!(
                    key = %key,
                    %tier,
                    operation = %cost.operation_label(),
                    cost = cost.cost,
                    capacity = quota.capacity,
                    "operation costs more than the whole bucket, check the cost table and tier capacities"
                );
                Err(AdmissionError::HardDeny {
                    key: key.to_string(),
                    operation: cost.operation_label(),
                    cost: cost.cost,
                    capacity: quota.capacity,
                    retry_after_secs: retry_after_secs(retry_after),
                })
            }
            Ok(AdmissionDecision::Denied { retry_after, .. }) => {
                tracing::info!(
                    key = %key,
                    %tier,
                    operation = %cost.operation_label(),
                    cost = cost.cost,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "quota exceeded"
                );
                Err(AdmissionError::QuotaExceeded {
                    key: key.to_string(),
                    operation: cost.operation_label(),
                    retry_after_secs: retry_after_secs(retry_after),
                })
            }
            Err(error) => match self.on_backend_error {
                FailurePolicy::FailOpen => {
                    tracing::warn!(
                        key = %key,
                        operation = %cost.operation_label(),
                        %error,
                        "quota store unavailable, admitting request without billing it"
                    );
                    Ok(None)
                }
                FailurePolicy::FailClosed => {
                    tracing::error!(
                        key = %key,
                        operation = %cost.operation_label(),
                        %error,
                        "quota store unavailable, refusing request"
                    );
                    Err(AdmissionError::BackendUnavailable {
                        key: key.to_string(),
                        reason: error.to_string(),
                    })
                }
            },
        }
    }
}

fn limiter_kind(limiter: &LimiterConfig) -> &'static str {
    match limiter {
        LimiterConfig::Local(_) => "local",
        LimiterConfig::Redis(_) => "redis",
    }
}
