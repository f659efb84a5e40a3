//! Retry policy
//!
//! Decides, after a failed attempt, whether the call should be retried and
//! how long to wait first. The loop itself lives in
//! [`MediaServerClient::api`](crate::MediaServerClient::api).

use std::time::Duration;

use tracing::error;

use crate::config::ClientConfig;
use crate::error::ClientError;

/// Default backoff unit: the delay before retry `n` is `unit * n²`
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(3);

/// Outcome of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again
    Retry(Duration),
    /// Return the error to the caller
    GiveUp,
}

/// Selective retry with quadratic backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 disables retrying)
    pub max_retry: u32,
    /// Status codes that are never retried
    pub never_retry: Vec<u16>,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 0,
            never_retry: vec![401, 403, 404],
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retry: config.max_retry,
            never_retry: config.retry_except.clone(),
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Delay before the retry following attempt `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt.saturating_mul(attempt))
    }

    /// Whether the error class is transient
    ///
    /// Connection failures, request timeouts, rate limiting and server
    /// errors are transient unless their status is in the never-retry set.
    /// Every other failure is terminal.
    pub fn is_retryable(&self, err: &ClientError) -> bool {
        match err {
            ClientError::Connection { .. } => true,
            ClientError::Http { status, .. } => {
                if self.never_retry.contains(status) {
                    return false;
                }
                matches!(*status, 408 | 429) || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// Decide what to do after attempt `attempt` failed with `err`
    pub fn decide(&self, attempt: u32, err: &ClientError, label: &str) -> RetryDecision {
        if !self.is_retryable(err) {
            if self.max_retry > 0 {
                match err.status_code() {
                    Some(status) => error!(
                        "Request on \"{}\" failed, tried {} times (no retry for the status code {})",
                        label, attempt, status
                    ),
                    None => error!("Request on \"{}\" failed, tried {} times (not retryable)", label, attempt),
                }
            }
            return RetryDecision::GiveUp;
        }
        if attempt > self.max_retry {
            if self.max_retry > 0 {
                error!("Request on \"{}\" failed, tried {} times (reached max retry count)", label, attempt);
            }
            return RetryDecision::GiveUp;
        }
        let delay = self.backoff_delay(attempt);
        error!(
            "Request on \"{}\" failed, tried {} times (max {}), retrying in {:?}",
            label, attempt, self.max_retry, delay
        );
        RetryDecision::Retry(delay)
    }
}
