//! Backend for Ollama's native chat API.
//!
//! [`OllamaBackend`] translates normalized [`LlmRequest`]s into Ollama's
//! `/api/chat` endpoint. Token counts come from `prompt_eval_count` and
//! `eval_count`.

use super::{error_from_response, Backend, LlmRequest, LlmResponse};
use crate::error::Result;
use crate::result::Usage;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Backend for a local or remote Ollama server.
#[derive(Debug, Clone, Default)]
pub struct OllamaBackend;

impl OllamaBackend {
    /// Build the Ollama `options` object from the generation params.
    fn build_options(request: &LlmRequest) -> Value {
        let mut opts = json!({
            "temperature": request.params.temperature,
            "num_predict": request.params.max_tokens,
        });
        if let Some(ref custom) = request.params.options {
            if let (Some(base), Some(extra)) = (opts.as_object_mut(), custom.as_object()) {
                for (k, v) in extra {
                    base.insert(k.clone(), v.clone());
                }
            }
        }
        opts
    }

    /// Build the JSON body for `/api/chat`.
    fn build_chat_body(request: &LlmRequest) -> Value {
        let mut messages = Vec::new();

        if let Some(ref sys) = request.system_prompt {
            if !sys.is_empty() {
                messages.push(json!({"role": "system", "content": sys}));
            }
        }

        // With history present, the prompt is already its first user turn.
        if request.messages.is_empty() {
            messages.push(json!({"role": "user", "content": request.prompt}));
        } else {
            for msg in &request.messages {
                messages.push(json!({"role": msg.role.as_str(), "content": msg.content}));
            }
        }

        json!({
            "model": request.model,
            "messages": messages,
            "stream": false,
            "options": Self::build_options(request),
        })
    }

    fn extract_usage(json_resp: &Value) -> Usage {
        let count = |key: &str| json_resp.get(key).and_then(Value::as_u64).unwrap_or(0);
        Usage::tokens(count("prompt_eval_count"), count("eval_count"))
    }

    fn extract_metadata(json_resp: &Value) -> Option<Value> {
        let mut meta = serde_json::Map::new();
        for key in ["model", "total_duration", "eval_duration"] {
            if let Some(v) = json_resp.get(key) {
                meta.insert(key.into(), v.clone());
            }
        }
        if meta.is_empty() {
            None
        } else {
            Some(Value::Object(meta))
        }
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn generate(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let url = format!("{}/api/chat", base_url.trim_end_matches('/'));
        let body = Self::build_chat_body(request);

        let resp = client.post(&url).json(&body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let json_resp: Value = resp.json().await?;
        let text = json_resp
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        Ok(LlmResponse {
            text,
            status,
            usage: Self::extract_usage(&json_resp),
            metadata: Self::extract_metadata(&json_resp),
        })
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}
