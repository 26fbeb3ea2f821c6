//! Refusals returned by admission control.

use std::time::Duration;

use displaydoc::Display;
use http::HeaderValue;
use http::StatusCode;
use serde_json_bytes::Value;
use thiserror::Error;

use crate::graphql;

pub(crate) const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
pub(crate) const ADMISSION_BACKEND_UNAVAILABLE: &str = "ADMISSION_BACKEND_UNAVAILABLE";

/// A request that was not admitted.
#[derive(Clone, Debug, Error, Display, PartialEq, Eq)]
#[non_exhaustive]
pub enum AdmissionError {
    /// {key} ran out of quota for {operation}, retry after {retry_after_secs}s
    QuotaExceeded {
        key: String,
        operation: String,
        retry_after_secs: u64,
    },

    /// {operation} costs {cost}, more than the whole {capacity} token bucket of {key}
    HardDeny {
        key: String,
        operation: String,
        cost: u64,
        capacity: u64,
        retry_after_secs: u64,
    },

    /// could not reach the quota store for {key}: {reason}
    BackendUnavailable { key: String, reason: String },
}

impl AdmissionError {
    /// Machine readable code sent to clients. Both kinds of denial share one code.
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::QuotaExceeded { .. } | AdmissionError::HardDeny { .. } => {
                RATE_LIMIT_EXCEEDED
            }
            AdmissionError::BackendUnavailable { .. } => ADMISSION_BACKEND_UNAVAILABLE,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::QuotaExceeded { .. } | AdmissionError::HardDeny { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AdmissionError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            AdmissionError::QuotaExceeded {
                retry_after_secs, ..
            }
            | AdmissionError::HardDeny {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            AdmissionError::BackendUnavailable { .. } => None,
        }
    }

    /// Value for a `Retry-After` response header.
    pub fn retry_after_header(&self) -> Option<HeaderValue> {
        self.retry_after_secs().map(HeaderValue::from)
    }

    pub fn key(&self) -> &str {
        match self {
            AdmissionError::QuotaExceeded { key, .. }
            | AdmissionError::HardDeny { key, .. }
            | AdmissionError::BackendUnavailable { key, .. } => key,
        }
    }
}

/// Whole seconds to wait, rounded up.
pub(crate) fn retry_after_secs(retry_after: Duration) -> u64 {
    u64::try_from(retry_after.as_millis().div_ceil(1000)).unwrap_or(u64::MAX)
}

impl From<&AdmissionError> for graphql::Error {
    fn from(error: &AdmissionError) -> Self {
        match error {
            AdmissionError::QuotaExceeded {
                key,
                operation,
                retry_after_secs,
            }
            | AdmissionError::HardDeny {
                key,
                operation,
                retry_after_secs,
                ..
            } => graphql::Error::builder()
                .message(format!(
                    "Rate limit exceeded, retry after {retry_after_secs} seconds"
                ))
                .extension("retryAfterSeconds", Value::from(*retry_after_secs))
                .extension("identity", key.as_str())
                .extension("operation", operation.as_str())
                .extension_code(error.code())
                .build(),
            AdmissionError::BackendUnavailable { key, .. } => graphql::Error::builder()
                .message("Admission control is temporarily unavailable")
                .extension("identity", key.as_str())
                .extension_code(error.code())
                .build(),
        }
    }
}

impl From<AdmissionError> for graphql::Error {
    fn from(error: AdmissionError) -> Self {
        graphql::Error::from(&error)
    }
}
