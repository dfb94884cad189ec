use crate::output_parser::ParseError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the workflow and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, reset, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON (de)serialization failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem failure (config loading, audit files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid workflow configuration detected at load time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A prompt template referenced a variable the context does not hold.
    #[error("Step '{step}' references missing placeholder '{{{placeholder}}}'")]
    MissingPlaceholder { step: String, placeholder: String },

    /// The provider did not answer within the per-attempt timeout.
    #[error("Provider timed out after {0:?}")]
    ProviderTimeout(Duration),

    /// The provider rejected the call because of rate limiting.
    #[error("Provider rate limited: {body}")]
    ProviderRateLimited {
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// HTTP error with status code and response body.
    ///
    /// Returned by [`Backend`](crate::backend::Backend) implementations for
    /// server-side failures. Whether it is retried depends on
    /// [`BackoffConfig::retryable_statuses`](crate::backend::BackoffConfig).
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 500, 503).
        status: u16,
        /// Response body text.
        body: String,
    },

    /// Permanent provider failure: bad credentials, invalid request, unknown model.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The response could not be parsed into the step's schema.
    #[error("Parse failed: {0}")]
    Parse(#[from] ParseError),

    /// The run was cancelled via the cancellation flag.
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

impl PipelineError {
    /// Serializable classification of this error, stored on failed steps.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidConfig(_) | PipelineError::MissingPlaceholder { .. } => {
                ErrorKind::Configuration
            }
            PipelineError::ProviderTimeout(_) => ErrorKind::ProviderTimeout,
            PipelineError::ProviderRateLimited { .. } => ErrorKind::ProviderRateLimited,
            PipelineError::HttpError { .. } | PipelineError::Request(_) => ErrorKind::Transport,
            PipelineError::Provider(_) => ErrorKind::Provider,
            PipelineError::Parse(_) => ErrorKind::Parse,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::Json(_) | PipelineError::Io(_) | PipelineError::Other(_) => {
                ErrorKind::Other
            }
        }
    }
}

/// Coarse error classification carried by failed [`StepResult`](crate::result::StepResult)s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The step could not even be attempted (bad template, unknown provider).
    Configuration,
    /// Every attempt timed out.
    ProviderTimeout,
    /// Every attempt was rate limited.
    ProviderRateLimited,
    /// Transient transport or 5xx failure that outlived the retry budget.
    Transport,
    /// Non-retryable provider rejection.
    Provider,
    /// The model never produced a parseable response.
    Parse,
    /// The run was cancelled.
    Cancelled,
    Other,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
