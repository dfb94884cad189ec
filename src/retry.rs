//! Per-step retry policy.
//!
//! [`RetryPolicy`] bounds how many times the step executor calls the
//! provider for one step. Transient transport failures always count against
//! the budget; unparseable output does too when `retry_on_parse_error` is
//! set, optionally replaying the conversation with a correction turn so the
//! model can see what it got wrong.

use crate::backend::BackoffConfig;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

/// Configuration for step-level retry.
///
/// # Example
///
/// ```
/// use tet_workflow::retry::RetryPolicy;
///
/// let policy = RetryPolicy::new(3);
/// assert_eq!(policy.max_attempts, 3);
///
/// // One shot, no re-generation on malformed output
/// let strict = RetryPolicy::new(1).no_parse_retry();
/// assert!(!strict.retry_on_parse_error);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total provider calls allowed for the step, including the first. Min 1.
    pub max_attempts: u32,

    /// Delay schedule between attempts.
    pub backoff: BackoffConfig,

    /// Re-generate when the response cannot be parsed. Default: `true`.
    pub retry_on_parse_error: bool,

    /// On a parse retry, replay the bad answer and name the missing
    /// sections. Default: `true`.
    pub parse_feedback: bool,

    /// Lower temperature by 0.2 on each parse retry (floored at 0.0).
    /// Default: `false`.
    pub cool_down: bool,
}

impl RetryPolicy {
    /// Allow up to `max_attempts` provider calls (clamped to at least 1).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Treat malformed output as final.
    pub fn no_parse_retry(mut self) -> Self {
        self.retry_on_parse_error = false;
        self
    }

    /// Re-generate from the original prompt without a correction turn.
    pub fn no_parse_feedback(mut self) -> Self {
        self.parse_feedback = false;
        self
    }

    pub fn with_cool_down(mut self) -> Self {
        self.cool_down = true;
        self
    }

    /// Attempts actually allowed, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether `error` may be retried under this policy.
    ///
    /// Retryable: timeouts, rate limits, connection failures, configured
    /// 5xx statuses, and parse failures when enabled. Everything else
    /// (bad credentials, invalid requests, bad templates) is final.
    pub fn is_retryable(&self, error: &PipelineError) -> bool {
        match error {
            PipelineError::ProviderTimeout(_) | PipelineError::ProviderRateLimited { .. } => true,
            PipelineError::Request(_) => true,
            PipelineError::HttpError { status, .. } => {
                self.backoff.retryable_statuses.contains(status)
            }
            PipelineError::Parse(_) => self.retry_on_parse_error,
            _ => false,
        }
    }

    /// Delay before retry number `retry` (0-indexed) following `last_error`.
    pub fn delay_after(&self, retry: u32, last_error: &PipelineError) -> std::time::Duration {
        match last_error {
            PipelineError::ProviderRateLimited {
                retry_after: Some(ra),
                ..
            } if self.backoff.respect_retry_after => *ra,
            _ => self.backoff.delay_for_attempt(retry),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::standard(),
            retry_on_parse_error: true,
            parse_feedback: true,
            cool_down: false,
        }
    }
}
