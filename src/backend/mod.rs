//! Backend trait, normalized request/response types and the provider registry.
//!
//! The [`Backend`] trait abstracts over LLM providers, translating between
//! normalized [`LlmRequest`]/[`LlmResponse`] types and provider-specific
//! HTTP APIs. Built-in implementations: [`OpenAiBackend`] (DeepSeek,
//! DashScope compatible mode, OpenAI), [`OllamaBackend`], [`MockBackend`].
//!
//! ## Architecture
//!
//! ```text
//! StepExecutor ──► LlmRequest ──► Backend::generate() ──► LlmResponse {text, usage}
//!                                        │
//!                          ┌─────────────┼─────────────┐
//!                    OpenAiBackend  OllamaBackend  MockBackend
//!               /v1/chat/completions  /api/chat     scripted
//! ```
//!
//! A [`ProviderRegistry`] binds the provider names used in step specs to a
//! backend, a base URL and a [`Pricing`] table.

pub mod backoff;
pub mod mock;
pub mod ollama;
pub mod openai;

pub use backoff::{BackoffConfig, JitterStrategy};
pub use mock::{MockBackend, MockReply};
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;

use crate::error::Result;
use crate::result::Usage;
use crate::step::GenerationParams;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A provider-agnostic LLM request.
///
/// The step executor builds this from a rendered [`StepSpec`](crate::step::StepSpec).
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Model identifier (e.g. `"deepseek-reasoner"`, `"qwen-max"`).
    pub model: String,

    /// Rendered system prompt, if the step has one.
    pub system_prompt: Option<String>,

    /// The rendered user prompt.
    pub prompt: String,

    /// For correction retries: prior conversation history (original prompt +
    /// bad response + correction). Empty for initial calls.
    pub messages: Vec<ChatMessage>,

    /// Temperature, token limit, timeout, extra options.
    pub params: GenerationParams,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            prompt: prompt.into(),
            messages: Vec::new(),
            params: GenerationParams::default(),
        }
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A normalized LLM response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// The generated text content.
    pub text: String,

    /// HTTP status code (for diagnostics/logging).
    pub status: u16,

    /// Token counts reported by the provider. Cost is filled in by the
    /// registry's [`Pricing`], not by the backend.
    pub usage: Usage,

    /// Provider-specific metadata (model info, timing).
    pub metadata: Option<serde_json::Value>,
}

/// Abstraction over LLM providers.
///
/// Implementors translate between the normalized [`LlmRequest`]/[`LlmResponse`]
/// and the provider's HTTP API, and classify failures into the
/// [`PipelineError`] taxonomy (see [`status_error`]).
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute one generation call.
    async fn generate(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Classify a non-success HTTP status.
///
/// 429 is a rate limit; 4xx client errors are permanent; everything else is
/// an [`PipelineError::HttpError`] whose retryability is decided by the
/// step's backoff config.
pub fn status_error(status: u16, body: String, retry_after: Option<Duration>) -> PipelineError {
    match status {
        429 => PipelineError::ProviderRateLimited { body, retry_after },
        400..=499 => PipelineError::Provider(format!("HTTP {}: {}", status, body)),
        _ => PipelineError::HttpError { status, body },
    }
}

/// Parse a `Retry-After` header value as seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Turn a non-success response into the matching error.
pub(crate) async fn error_from_response(resp: reqwest::Response) -> PipelineError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = resp.text().await.unwrap_or_default();
    status_error(status, body, retry_after)
}

/// Strip known provider path suffixes from a base URL.
/// This prevents double-pathing when backends append their own paths.
/// e.g., "https://api.deepseek.com/v1" -> "https://api.deepseek.com"
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    // longest first
    for suffix in ["/v1/chat/completions", "/v1/chat", "/v1", "/api/chat", "/api"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

/// Price per million tokens, in the provider's billing currency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

impl Pricing {
    pub fn new(input_per_million: Decimal, output_per_million: Decimal) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Cost of one call with the given token counts.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> Decimal {
        let million = Decimal::from(1_000_000u32);
        (Decimal::from(prompt_tokens) * self.input_per_million
            + Decimal::from(completion_tokens) * self.output_per_million)
            / million
    }
}

/// One registered provider.
#[derive(Clone)]
pub struct ProviderBinding {
    pub backend: Arc<dyn Backend>,
    pub base_url: String,
    pub pricing: Pricing,
}

impl std::fmt::Debug for ProviderBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderBinding")
            .field("backend", &self.backend.name())
            .field("base_url", &self.base_url)
            .field("pricing", &self.pricing)
            .finish()
    }
}

impl ProviderBinding {
    /// Call the backend and price the reported usage.
    pub async fn generate(&self, client: &Client, request: &LlmRequest) -> Result<LlmResponse> {
        let mut response = self
            .backend
            .generate(client, &self.base_url, request)
            .await?;
        response.usage.cost = self
            .pricing
            .cost(response.usage.prompt_tokens, response.usage.completion_tokens);
        Ok(response)
    }
}

/// Provider name → backend binding, plus the shared HTTP client.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tet_workflow::backend::{MockBackend, ProviderRegistry};
///
/// let registry = ProviderRegistry::new()
///     .with_provider("mock", Arc::new(MockBackend::fixed("ok")), "http://unused");
/// assert!(registry.contains("mock"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    client: Client,
    providers: HashMap<String, ProviderBinding>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured HTTP client (proxies, TLS settings).
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Register a provider with zero pricing.
    pub fn with_provider(
        self,
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
        base_url: impl Into<String>,
    ) -> Self {
        self.with_priced_provider(name, backend, base_url, Pricing::default())
    }

    pub fn with_priced_provider(
        mut self,
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
        base_url: impl Into<String>,
        pricing: Pricing,
    ) -> Self {
        self.register(name, backend, base_url, pricing);
        self
    }

    /// Register (or replace) a provider binding.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
        base_url: impl Into<String>,
        pricing: Pricing,
    ) {
        let base_url = normalize_base_url(&base_url.into());
        self.providers.insert(
            name.into(),
            ProviderBinding {
                backend,
                base_url,
                pricing,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&ProviderBinding> {
        self.providers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(429, "slow".into(), Some(Duration::from_secs(3))),
            PipelineError::ProviderRateLimited {
                retry_after: Some(_),
                ..
            }
        ));
        assert!(matches!(
            status_error(401, "bad key".into(), None),
            PipelineError::Provider(_)
        ));
        assert!(matches!(
            status_error(422, "bad param".into(), None),
            PipelineError::Provider(_)
        ));
        assert!(matches!(
            status_error(503, "down".into(), None),
            PipelineError::HttpError { status: 503, .. }
        ));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("https://api.deepseek.com/v1/"), "https://api.deepseek.com");
        assert_eq!(normalize_base_url("http://localhost:11434/api"), "http://localhost:11434");
        assert_eq!(
            normalize_base_url("https://dashscope.aliyuncs.com/compatible-mode/v1"),
            "https://dashscope.aliyuncs.com/compatible-mode"
        );
        assert_eq!(normalize_base_url("http://localhost:11434"), "http://localhost:11434");
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = Pricing::new(dec("0.27"), dec("1.10"));
        assert_eq!(pricing.cost(1_000_000, 0), dec("0.27"));
        assert_eq!(pricing.cost(2_000, 1_000), dec("0.00164"));
        assert_eq!(Pricing::default().cost(500, 500), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_binding_prices_usage() {
        let mock = MockBackend::new(vec![MockReply::text("hi").with_usage(1_000, 500)]);
        let registry = ProviderRegistry::new().with_priced_provider(
            "deepseek",
            Arc::new(mock),
            "http://unused",
            Pricing::new(dec("1"), dec("2")),
        );
        let binding = registry.get("deepseek").unwrap();
        let resp = binding
            .generate(registry.client(), &LlmRequest::new("m", "p"))
            .await
            .unwrap();
        assert_eq!(resp.usage.prompt_tokens, 1_000);
        assert_eq!(resp.usage.cost, dec("0.002"));
    }

    #[test]
    fn test_registry_names_sorted() {
        let registry = ProviderRegistry::new()
            .with_provider("tongyi", Arc::new(MockBackend::fixed("a")), "http://a")
            .with_provider("deepseek", Arc::new(MockBackend::fixed("b")), "http://b");
        assert_eq!(registry.names(), vec!["deepseek", "tongyi"]);
        assert!(registry.get("ollama").is_none());
    }
}
