//! Step specifications.
//!
//! A [`StepSpec`] is the immutable description of one pipeline position:
//! which provider and model to call, the prompt template, how to parse the
//! answer, how hard to retry, and whether the run can survive its failure.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Generation parameters sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Temperature (0.0 = deterministic, 1.0+ = creative).
    pub temperature: f64,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Per-attempt timeout.
    #[serde(rename = "timeout_secs", with = "crate::backend::backoff::secs")]
    pub timeout: Duration,

    /// Provider-specific options merged into the request body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            timeout: Duration::from_secs(180),
            options: None,
        }
    }
}

impl GenerationParams {
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Per-branch adjustments for a parallel stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamOverride {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub model: Option<String>,
}

/// Fan-out settings for a step that generates several candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelSpec {
    /// Number of branches (≥ 1).
    pub count: usize,
    /// Optional overrides, applied by branch index. May be shorter than `count`.
    #[serde(default)]
    pub overrides: Vec<ParamOverride>,
}

/// What a step does with its position in the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    /// Render, call, parse. The common case.
    #[default]
    Generate,
    /// Judge the candidates of the preceding parallel step.
    Select,
}

/// Configuration for one pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique step name (used in results, events, and as default namespace).
    pub name: String,

    /// Step kind; selects the output schema.
    pub kind: String,

    /// Provider binding (a name registered in the provider registry).
    pub provider: String,

    /// Model identifier (e.g. `"deepseek-reasoner"`, `"qwen-max"`).
    pub model: String,

    /// User prompt template.
    pub prompt: String,

    /// Optional system prompt template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    #[serde(default)]
    pub params: GenerationParams,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// A failed required step halts the run. Default: `true`.
    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelSpec>,

    #[serde(default)]
    pub role: StepRole,

    /// Context namespace for this step's fields. Default: the step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Field → explicit context key. Aliased keys may rebind earlier values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aliases: BTreeMap<String, String>,

    /// Select steps only: candidate fields shown to the judge. Empty = all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidate_fields: Vec<String>,
}

fn default_required() -> bool {
    true
}

impl StepSpec {
    /// Create a required, sequential generate step with default params and retry.
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            provider: provider.into(),
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            params: GenerationParams::default(),
            retry: RetryPolicy::default(),
            required: true,
            parallel: None,
            role: StepRole::Generate,
            namespace: None,
            aliases: BTreeMap::new(),
            candidate_fields: Vec::new(),
        }
    }

    /// A select step judging the previous parallel stage.
    pub fn selector(
        name: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let mut spec = Self::new(
            name,
            crate::output_parser::EVALUATION,
            provider,
            model,
            prompt,
        );
        spec.role = StepRole::Select;
        spec
    }

    pub fn with_system(mut self, template: impl Into<String>) -> Self {
        self.system = Some(template.into());
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Mark the step optional: its failure is recorded, the run continues.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Fan out into `count` branches.
    pub fn with_parallel(mut self, count: usize, overrides: Vec<ParamOverride>) -> Self {
        self.parallel = Some(ParallelSpec { count, overrides });
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_alias(mut self, field: impl Into<String>, key: impl Into<String>) -> Self {
        self.aliases.insert(field.into(), key.into());
        self
    }

    pub fn with_candidate_fields(mut self, fields: &[&str]) -> Self {
        self.candidate_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Namespace this step's fields are published under.
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.name)
    }

    /// Number of branches (1 when not parallel).
    pub fn parallel_count(&self) -> usize {
        self.parallel.as_ref().map_or(1, |p| p.count)
    }

    /// Spec for branch `index` with its overrides applied.
    pub fn branch(&self, index: usize) -> StepSpec {
        let mut spec = self.clone();
        if let Some(ov) = self
            .parallel
            .as_ref()
            .and_then(|p| p.overrides.get(index))
        {
            if let Some(t) = ov.temperature {
                spec.params.temperature = t;
            }
            if let Some(m) = ov.max_tokens {
                spec.params.max_tokens = m;
            }
            if let Some(ref model) = ov.model {
                spec.model = model.clone();
            }
        }
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> StepSpec {
        StepSpec::new("initial", "initial_translation", "mock", "m1", "Translate {original_poem}")
    }

    #[test]
    fn test_defaults() {
        let s = spec();
        assert!(s.required);
        assert_eq!(s.role, StepRole::Generate);
        assert_eq!(s.namespace(), "initial");
        assert_eq!(s.parallel_count(), 1);
    }

    #[test]
    fn test_branch_overrides() {
        let s = spec().with_parallel(
            3,
            vec![
                ParamOverride {
                    temperature: Some(0.2),
                    ..Default::default()
                },
                ParamOverride {
                    model: Some("m2".into()),
                    max_tokens: Some(100),
                    ..Default::default()
                },
            ],
        );
        assert_eq!(s.branch(0).params.temperature, 0.2);
        assert_eq!(s.branch(1).model, "m2");
        assert_eq!(s.branch(1).params.max_tokens, 100);
        assert_eq!(s.branch(1).params.temperature, 0.7);
        // no override for the third branch
        assert_eq!(s.branch(2), s);
    }

    #[test]
    fn test_selector() {
        let s = StepSpec::selector("evaluate", "mock", "judge", "{candidates}");
        assert_eq!(s.role, StepRole::Select);
        assert_eq!(s.kind, "evaluation");
    }

    #[test]
    fn test_deserialize_minimal() {
        let json = r#"{
            "name": "revise",
            "kind": "translator_revision",
            "provider": "deepseek",
            "model": "deepseek-chat",
            "prompt": "Revise {initial.initial_translation}",
            "params": {"temperature": 0.2, "timeout_secs": 30}
        }"#;
        let s: StepSpec = serde_json::from_str(json).unwrap();
        assert!(s.required);
        assert_eq!(s.params.temperature, 0.2);
        assert_eq!(s.params.timeout, Duration::from_secs(30));
        assert_eq!(s.params.max_tokens, 4096);
        assert_eq!(s.retry.max_attempts, 3);
    }
}
