//! Classified remote failures and the backoff policy applied to them.
//!
//! Only transient failures are retried. Missing resources and rejected
//! requests fail immediately so callers can fall back to an empty result.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{operation}: not found ({message})")]
    NotFound { operation: String, message: String },
    #[error("{operation} rejected: {message}")]
    Permanent { operation: String, message: String },
    #[error("{operation} failed: {message}")]
    Transient { operation: String, message: String },
}

impl RemoteError {
    pub fn not_found(operation: &str, message: impl Into<String>) -> Self {
        Self::NotFound {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(operation: &str, message: impl Into<String>) -> Self {
        Self::Permanent {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn transient(operation: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(operation: &str, status: StatusCode, body: &str) -> Self {
        let message = format!("{} - {}", status, body);
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => Self::not_found(operation, message),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                Self::transient(operation, message)
            }
            s if s.is_server_error() => Self::transient(operation, message),
            _ => Self::permanent(operation, message),
        }
    }

    /// Classify a transport-level failure.
    pub fn from_reqwest(operation: &str, err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_builder() {
            Self::permanent(operation, err.to_string())
        } else {
            Self::transient(operation, err.to_string())
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Exponential backoff: `initial * 2^n`, capped at `max`, for at most
/// `attempts` tries in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            attempts,
            initial,
            max,
        }
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Reads from the tracking API.
pub const TRACKING_RETRY: RetryPolicy =
    RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(120));

/// Posting messages to the chat surface.
pub const POST_RETRY: RetryPolicy =
    RetryPolicy::new(5, Duration::from_secs(2), Duration::from_secs(120));

/// Opening direct-message conversations.
pub const OPEN_CONVERSATION_RETRY: RetryPolicy =
    RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30));

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. The last error is returned.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    attempt + 1,
                    policy.attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
