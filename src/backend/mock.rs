//! Mock backend for testing without a live LLM.
//!
//! [`MockBackend`] plays back a script of [`MockReply`]s in order, allowing
//! deterministic tests of retry, parsing and selection behavior.
//!
//! # Example
//!
//! ```
//! use tet_workflow::backend::{MockBackend, MockReply};
//!
//! let mock = MockBackend::new(vec![
//!     MockReply::server_error(503),
//!     MockReply::text("<initial_translation>Moonlight</initial_translation>").with_usage(120, 40),
//! ]);
//! assert_eq!(mock.calls(), 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{status_error, Backend, LlmRequest, LlmResponse};
use crate::error::Result;
use crate::result::Usage;
use crate::PipelineError;

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// A successful generation.
    Text {
        text: String,
        prompt_tokens: u64,
        completion_tokens: u64,
        /// Simulated latency before answering.
        delay: Option<Duration>,
    },
    /// An HTTP failure, classified like a real backend would.
    Status {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    /// A final failure with no HTTP status, never retried.
    Fail(String),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text {
            text: text.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            delay: None,
        }
    }

    /// Set token counts on a text reply. No effect on failures.
    pub fn with_usage(mut self, prompt: u64, completion: u64) -> Self {
        if let MockReply::Text {
            prompt_tokens,
            completion_tokens,
            ..
        } = &mut self
        {
            *prompt_tokens = prompt;
            *completion_tokens = completion;
        }
        self
    }

    /// Answer only after `delay`. Use with a short step timeout to simulate hangs.
    pub fn after(mut self, latency: Duration) -> Self {
        if let MockReply::Text { delay, .. } = &mut self {
            *delay = Some(latency);
        }
        self
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        MockReply::Status {
            status: 429,
            body: "rate limit exceeded".into(),
            retry_after,
        }
    }

    pub fn server_error(status: u16) -> Self {
        MockReply::Status {
            status,
            body: "upstream unavailable".into(),
            retry_after: None,
        }
    }

    /// A permanent rejection (HTTP 401).
    pub fn rejected(body: impl Into<String>) -> Self {
        MockReply::Status {
            status: 401,
            body: body.into(),
            retry_after: None,
        }
    }
}

/// A test backend that returns scripted replies in order.
///
/// Cycles back to the beginning when the script is exhausted. Every request
/// is recorded so tests can inspect prompts, overrides and correction turns.
#[derive(Debug)]
pub struct MockBackend {
    replies: Vec<MockReply>,
    index: AtomicUsize,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockBackend {
    /// Create a mock backend with the given script.
    ///
    /// An empty script answers every call with an empty string.
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock that always returns the same text.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![MockReply::text(response)])
    }

    /// Create a mock from plain text replies.
    pub fn texts<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(responses.into_iter().map(MockReply::text).collect())
    }

    /// Number of `generate` calls made so far.
    pub fn calls(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }

    /// Snapshot of every request received, in call order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn next_reply(&self) -> Option<MockReply> {
        if self.replies.is_empty() {
            self.index.fetch_add(1, Ordering::SeqCst);
            return None;
        }
        let idx = self.index.fetch_add(1, Ordering::SeqCst) % self.replies.len();
        Some(self.replies[idx].clone())
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn generate(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        match self.next_reply() {
            None => Ok(LlmResponse {
                text: String::new(),
                status: 200,
                usage: Usage::default(),
                metadata: None,
            }),
            Some(MockReply::Text {
                text,
                prompt_tokens,
                completion_tokens,
                delay,
            }) => {
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                Ok(LlmResponse {
                    text,
                    status: 200,
                    usage: Usage::tokens(prompt_tokens, completion_tokens),
                    metadata: None,
                })
            }
            Some(MockReply::Status {
                status,
                body,
                retry_after,
            }) => Err(status_error(status, body, retry_after)),
            Some(MockReply::Fail(msg)) => Err(PipelineError::Other(msg)),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
