//! Workflow configuration.
//!
//! A [`PipelineConfig`] is plain data (JSON, or YAML with the `yaml`
//! feature) naming the providers, the declared inputs and the ordered
//! steps. Everything that can be checked without calling a model is
//! checked once, when the config is turned into a [`Pipeline`]; a run never
//! fails on a problem that was visible at load time.
//!
//! ```
//! use tet_workflow::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_json_str(r#"{
//!     "name": "tet",
//!     "inputs": ["original_poem"],
//!     "providers": {
//!         "local": { "type": "ollama", "base_url": "http://localhost:11434" }
//!     },
//!     "steps": [{
//!         "name": "initial",
//!         "kind": "initial_translation",
//!         "provider": "local",
//!         "model": "qwen3:8b",
//!         "prompt": "Translate:\n{original_poem}"
//!     }]
//! }"#).unwrap();
//! let pipeline = config.build().unwrap();
//! assert_eq!(pipeline.name(), "tet");
//! ```

use crate::backend::{OllamaBackend, OpenAiBackend, Pricing, ProviderRegistry};
use crate::context::context_key;
use crate::error::{PipelineError, Result};
use crate::output_parser::{
    ParserRegistry, EDITOR_REVIEW, INITIAL_TRANSLATION, TRANSLATOR_REVISION,
};
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::selection::{CANDIDATES_KEY, CANDIDATE_COUNT_KEY};
use crate::step::{StepRole, StepSpec};
use crate::template::placeholders;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// `/v1/chat/completions` (OpenAI, DeepSeek, Qwen, vLLM, LM Studio ...).
    Openai,
    Ollama,
}

/// One named provider binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: ProviderKind,

    pub base_url: String,

    /// Environment variable holding the API key. Keys never live in config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    #[serde(default)]
    pub pricing: Pricing,
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,

    /// Context variables the caller supplies at run time.
    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    pub steps: Vec<StepSpec>,
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| PipelineError::InvalidConfig(format!("YAML: {}", e)))
    }

    /// Load from a file, choosing the format by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            #[cfg(feature = "yaml")]
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            #[cfg(not(feature = "yaml"))]
            Some("yaml") | Some("yml") => Err(PipelineError::InvalidConfig(format!(
                "{}: YAML configs need the `yaml` feature",
                path.display()
            ))),
            _ => Err(PipelineError::InvalidConfig(format!(
                "{}: unknown config format",
                path.display()
            ))),
        }
    }

    /// The stock Translator → Editor → Translator workflow.
    ///
    /// With `candidates > 1` the initial translation fans out and an
    /// `evaluate` step picks the best draft before the editor sees it.
    pub fn translation(provider: &str, model: &str, candidates: usize) -> Self {
        let mut steps = Vec::new();

        let mut initial = StepSpec::new(
            "initial",
            INITIAL_TRANSLATION,
            provider,
            model,
            INITIAL_PROMPT,
        )
        .with_system(TRANSLATOR_SYSTEM);
        if candidates > 1 {
            initial = initial.with_parallel(candidates, Vec::new());
        }
        steps.push(initial);

        if candidates > 1 {
            steps.push(
                StepSpec::selector("evaluate", provider, model, EVALUATE_PROMPT)
                    .with_candidate_fields(&["initial_translation", "initial_translation_notes"])
                    .with_system(EDITOR_SYSTEM),
            );
        }
        steps.push(
            StepSpec::new("review", EDITOR_REVIEW, provider, model, REVIEW_PROMPT)
                .with_system(EDITOR_SYSTEM),
        );
        steps.push(
            StepSpec::new("revise", TRANSLATOR_REVISION, provider, model, REVISE_PROMPT)
                .with_system(TRANSLATOR_SYSTEM),
        );

        Self {
            name: "tet".to_string(),
            inputs: ["original_poem", "source_lang", "target_lang"]
                .into_iter()
                .map(String::from)
                .collect(),
            providers: BTreeMap::new(),
            steps,
        }
    }

    /// Build backends for every configured provider.
    ///
    /// API keys are read from the environment here.
    pub fn provider_registry(&self) -> Result<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        for (name, provider) in &self.providers {
            let backend: Arc<dyn crate::backend::Backend> = match provider.kind {
                ProviderKind::Ollama => Arc::new(OllamaBackend),
                ProviderKind::Openai => {
                    let mut backend = OpenAiBackend::new();
                    if let Some(ref var) = provider.api_key_env {
                        let key = std::env::var(var).map_err(|_| {
                            PipelineError::InvalidConfig(format!(
                                "provider '{}': environment variable {} is not set",
                                name, var
                            ))
                        })?;
                        backend = backend.with_api_key(key);
                    }
                    if let Some(ref org) = provider.organization {
                        backend = backend.with_organization(org.clone());
                    }
                    Arc::new(backend)
                }
            };
            registry.register(
                name.clone(),
                backend,
                provider.base_url.clone(),
                provider.pricing,
            );
        }
        Ok(registry)
    }

    /// A builder with the configured providers, ready for sinks.
    pub fn builder(&self) -> Result<PipelineBuilder> {
        Ok(self.builder_with(self.provider_registry()?))
    }

    /// A builder using `providers` instead of the configured ones.
    pub fn builder_with(&self, providers: ProviderRegistry) -> PipelineBuilder {
        Pipeline::builder(self.name.clone())
            .inputs(self.inputs.iter().cloned())
            .steps(self.steps.iter().cloned())
            .providers(providers)
    }

    /// Validate and build with the configured providers and built-in kinds.
    pub fn build(&self) -> Result<Pipeline> {
        self.builder()?.build()
    }
}

fn invalid(msg: impl Into<String>) -> PipelineError {
    PipelineError::InvalidConfig(msg.into())
}

/// Check a step list before it is allowed to run.
pub(crate) fn validate_steps(
    steps: &[StepSpec],
    inputs: &[String],
    providers: &ProviderRegistry,
    parsers: &ParserRegistry,
) -> Result<()> {
    if steps.is_empty() {
        return Err(invalid("pipeline has no steps"));
    }

    let mut names = HashSet::new();
    for step in steps {
        if step.name.trim().is_empty() {
            return Err(invalid("step with empty name"));
        }
        if !names.insert(step.name.as_str()) {
            return Err(invalid(format!("duplicate step name '{}'", step.name)));
        }
        if !providers.contains(&step.provider) {
            return Err(invalid(format!(
                "step '{}': unknown provider '{}'",
                step.name, step.provider
            )));
        }
        if !parsers.contains(&step.kind) {
            return Err(invalid(format!(
                "step '{}': unregistered kind '{}'",
                step.name, step.kind
            )));
        }
        if let Some(ref parallel) = step.parallel {
            if parallel.count == 0 {
                return Err(invalid(format!(
                    "step '{}': parallel count must be at least 1",
                    step.name
                )));
            }
            if parallel.overrides.len() > parallel.count {
                return Err(invalid(format!(
                    "step '{}': {} overrides for {} branches",
                    step.name,
                    parallel.overrides.len(),
                    parallel.count
                )));
            }
        }
    }

    for (i, step) in steps.iter().enumerate() {
        let prev_parallel = i > 0 && steps[i - 1].parallel.is_some();
        let next_select = steps
            .get(i + 1)
            .is_some_and(|s| s.role == StepRole::Select);
        match step.role {
            StepRole::Select if step.parallel.is_some() => {
                return Err(invalid(format!(
                    "select step '{}' cannot be parallel",
                    step.name
                )));
            }
            StepRole::Select if !prev_parallel => {
                return Err(invalid(format!(
                    "select step '{}' must directly follow a parallel step",
                    step.name
                )));
            }
            StepRole::Generate if step.parallel.is_some() && !next_select => {
                return Err(invalid(format!(
                    "parallel step '{}' must be directly followed by a select step",
                    step.name
                )));
            }
            _ => {}
        }
    }

    check_bindings(steps, inputs, parsers)
}

/// Walk the steps in order, tracking which context keys exist.
///
/// `conditional` keys may be absent at run time (optional producers,
/// optional schema fields, judge output) and must be read as `{key?}`.
fn check_bindings(steps: &[StepSpec], inputs: &[String], parsers: &ParserRegistry) -> Result<()> {
    let mut available: HashSet<String> = inputs.iter().cloned().collect();
    let mut conditional: HashSet<String> = HashSet::new();
    let mut producer: HashMap<String, String> = inputs
        .iter()
        .map(|k| (k.clone(), "input".to_string()))
        .collect();

    for step in steps {
        let mut visible = available.clone();
        if step.role == StepRole::Select {
            visible.insert(CANDIDATES_KEY.to_string());
            visible.insert(CANDIDATE_COUNT_KEY.to_string());
        }

        let templates = std::iter::once(step.prompt.as_str()).chain(step.system.as_deref());
        for template in templates {
            for ph in placeholders(template) {
                if !visible.contains(&ph.name) {
                    return Err(invalid(format!(
                        "step '{}': no input or earlier step provides '{{{}}}'",
                        step.name, ph.name
                    )));
                }
                if conditional.contains(&ph.name) && !ph.optional {
                    return Err(invalid(format!(
                        "step '{}': '{}' may be absent and must be written '{{{}?}}'",
                        step.name, ph.name, ph.name
                    )));
                }
            }
        }

        let Some(schema) = parsers.get(&step.kind) else {
            continue;
        };
        for field in step.aliases.keys() {
            if !schema.fields().any(|f| f == field) {
                return Err(invalid(format!(
                    "step '{}': alias for unknown field '{}'",
                    step.name, field
                )));
            }
        }

        let whole_step_conditional = !step.required || step.role == StepRole::Select;
        for field in schema.fields() {
            let aliased = step.aliases.get(field);
            let key = aliased
                .cloned()
                .unwrap_or_else(|| context_key(step.namespace(), field));
            if aliased.is_none() && available.contains(&key) {
                return Err(invalid(format!(
                    "step '{}': field '{}' would overwrite '{}' (set by {}); add an alias",
                    step.name,
                    field,
                    key,
                    producer.get(&key).map_or("an earlier step", String::as_str)
                )));
            }
            let optional_field = !schema.required.iter().any(|r| r == field);
            if whole_step_conditional || optional_field {
                conditional.insert(key.clone());
            } else {
                conditional.remove(&key);
            }
            producer.insert(key.clone(), format!("step '{}'", step.name));
            available.insert(key);
        }
    }
    Ok(())
}

const TRANSLATOR_SYSTEM: &str = "You are an accomplished literary translator of poetry. \
Preserve imagery, tone and form. Answer only with the requested tagged sections.";

const EDITOR_SYSTEM: &str = "You are a demanding poetry editor fluent in both languages. \
Be specific and actionable. Answer only with the requested tagged sections.";

const INITIAL_PROMPT: &str = "Translate this poem from {source_lang} into {target_lang}.

<original_poem>
{original_poem}
</original_poem>

Respond with:
<translated_poem_title>title</translated_poem_title>
<translated_poet_name>poet</translated_poet_name>
<initial_translation>the translation</initial_translation>
<initial_translation_notes>your choices and their reasons</initial_translation_notes>";

const EVALUATE_PROMPT: &str = "Below are {candidate_count} candidate translations of this poem.

<original_poem>
{original_poem}
</original_poem>

{candidates}

Compare them for fidelity, music and naturalness in {target_lang}. Respond with:
<critique>a short comparison</critique>
<best_candidate>the number of the best candidate</best_candidate>";

const REVIEW_PROMPT: &str = "Review this {target_lang} translation of a {source_lang} poem.

<original_poem>
{original_poem}
</original_poem>

<translation>
{initial.initial_translation}
</translation>

<translator_notes>
{initial.initial_translation_notes}
</translator_notes>

Respond with:
<editor_suggestions>numbered, concrete suggestions</editor_suggestions>
<overall_assessment>one paragraph</overall_assessment>";

const REVISE_PROMPT: &str = "Revise your translation using the editor's feedback.

<original_poem>
{original_poem}
</original_poem>

<translation>
{initial.initial_translation}
</translation>

<editor_suggestions>
{review.editor_suggestions}
</editor_suggestions>

Respond with:
<refined_translated_poem_title>title</refined_translated_poem_title>
<refined_translated_poet_name>poet</refined_translated_poet_name>
<revised_translation>the revised translation</revised_translation>
<revised_translation_notes>what changed and why</revised_translation_notes>";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    fn mock_registry(names: &[&str]) -> ProviderRegistry {
        names.iter().fold(ProviderRegistry::new(), |r, n| {
            r.with_provider(*n, Arc::new(MockBackend::fixed("")), "http://unused")
        })
    }

    fn check(steps: &[StepSpec], inputs: &[&str]) -> Result<()> {
        let inputs: Vec<String> = inputs.iter().map(|s| s.to_string()).collect();
        validate_steps(
            steps,
            &inputs,
            &mock_registry(&["m"]),
            &ParserRegistry::with_builtins(),
        )
    }

    fn generate(name: &str, kind: &str, prompt: &str) -> StepSpec {
        StepSpec::new(name, kind, "m", "model", prompt)
    }

    fn err_text(r: Result<()>) -> String {
        r.unwrap_err().to_string()
    }

    #[test]
    fn test_stock_workflow_is_valid() {
        for n in [1, 3] {
            let config = PipelineConfig::translation("m", "model", n);
            let pipeline = config.builder_with(mock_registry(&["m"])).build();
            assert!(pipeline.is_ok(), "candidates={}: {:?}", n, pipeline.err());
        }
        assert_eq!(PipelineConfig::translation("m", "x", 3).steps.len(), 4);
        assert_eq!(PipelineConfig::translation("m", "x", 1).steps.len(), 3);
    }

    #[test]
    fn test_rejects_unknown_placeholder() {
        let steps = [generate("a", INITIAL_TRANSLATION, "{poem}")];
        let e = err_text(check(&steps, &["original_poem"]));
        assert!(e.contains("'{poem}'"), "{}", e);
    }

    #[test]
    fn test_rejects_forward_reference() {
        let steps = [
            generate("review", EDITOR_REVIEW, "{initial.initial_translation}"),
            generate("initial", INITIAL_TRANSLATION, "{p}"),
        ];
        assert!(check(&steps, &["p"]).is_err());
    }

    #[test]
    fn test_rejects_duplicate_names_and_unknown_bindings() {
        let dup = [generate("a", INITIAL_TRANSLATION, "{p}"), generate("a", EDITOR_REVIEW, "{p}")];
        assert!(err_text(check(&dup, &["p"])).contains("duplicate"));

        let kind = [generate("a", "haiku", "{p}")];
        assert!(err_text(check(&kind, &["p"])).contains("unregistered kind"));

        let provider = [StepSpec::new("a", INITIAL_TRANSLATION, "nope", "m", "{p}")];
        assert!(err_text(check(&provider, &["p"])).contains("unknown provider"));
    }

    #[test]
    fn test_parallel_needs_following_select() {
        let alone = [generate("a", INITIAL_TRANSLATION, "{p}").with_parallel(3, vec![])];
        assert!(err_text(check(&alone, &["p"])).contains("followed by a select"));

        let stray = [
            generate("a", INITIAL_TRANSLATION, "{p}"),
            StepSpec::selector("judge", "m", "model", "{candidates}"),
        ];
        assert!(err_text(check(&stray, &["p"])).contains("follow a parallel"));
    }

    #[test]
    fn test_parallel_counts_checked() {
        let zero = [
            generate("a", INITIAL_TRANSLATION, "{p}").with_parallel(0, vec![]),
            StepSpec::selector("judge", "m", "model", "{candidates}"),
        ];
        assert!(err_text(check(&zero, &["p"])).contains("at least 1"));

        let too_many = [
            generate("a", INITIAL_TRANSLATION, "{p}")
                .with_parallel(1, vec![Default::default(), Default::default()]),
            StepSpec::selector("judge", "m", "model", "{candidates}"),
        ];
        assert!(err_text(check(&too_many, &["p"])).contains("2 overrides for 1"));
    }

    #[test]
    fn test_candidates_only_visible_to_select() {
        let steps = [generate("a", INITIAL_TRANSLATION, "{candidates}")];
        assert!(check(&steps, &[]).is_err());
    }

    #[test]
    fn test_collision_needs_alias() {
        let steps = [
            generate("a", INITIAL_TRANSLATION, "{p}").with_namespace("draft"),
            generate("b", INITIAL_TRANSLATION, "{p}").with_namespace("draft"),
        ];
        assert!(err_text(check(&steps, &["p"])).contains("add an alias"));

        let aliased = [
            generate("a", INITIAL_TRANSLATION, "{p}").with_namespace("draft"),
            generate("b", INITIAL_TRANSLATION, "{p}")
                .with_namespace("draft")
                .with_alias("initial_translation", "draft.initial_translation")
                .with_alias("initial_translation_notes", "draft.initial_translation_notes")
                .with_alias("translated_poem_title", "draft.translated_poem_title")
                .with_alias("translated_poet_name", "draft.translated_poet_name"),
        ];
        assert!(check(&aliased, &["p"]).is_ok());
    }

    #[test]
    fn test_optional_producer_needs_question_mark() {
        let strict = [
            generate("review", EDITOR_REVIEW, "{p}").optional(),
            generate("revise", TRANSLATOR_REVISION, "{review.editor_suggestions}"),
        ];
        assert!(err_text(check(&strict, &["p"])).contains("{review.editor_suggestions?}"));

        let lenient = [
            generate("review", EDITOR_REVIEW, "{p}").optional(),
            generate("revise", TRANSLATOR_REVISION, "{review.editor_suggestions?}"),
        ];
        assert!(check(&lenient, &["p"]).is_ok());
    }

    #[test]
    fn test_optional_schema_field_needs_question_mark() {
        let steps = [
            generate("initial", INITIAL_TRANSLATION, "{p}"),
            generate("review", EDITOR_REVIEW, "{initial.translated_poem_title}"),
        ];
        assert!(check(&steps, &["p"]).is_err());
    }

    #[test]
    fn test_json_config_round_trip() {
        let config = PipelineConfig::translation("m", "deepseek-chat", 3);
        let json = serde_json::to_string(&config).unwrap();
        let back = PipelineConfig::from_json_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_provider_config_parses_pricing() {
        let config = PipelineConfig::from_json_str(
            r#"{
                "name": "x",
                "providers": {
                    "ds": {
                        "type": "openai",
                        "base_url": "https://api.deepseek.com/v1",
                        "pricing": { "input_per_million": "0.27", "output_per_million": "1.10" }
                    }
                },
                "steps": []
            }"#,
        )
        .unwrap();
        let ds = &config.providers["ds"];
        assert_eq!(ds.kind, ProviderKind::Openai);
        assert_eq!(ds.pricing.input_per_million.to_string(), "0.27");
        assert!(config.provider_registry().unwrap().contains("ds"));
    }

    #[test]
    fn test_missing_api_key_env_is_config_error() {
        let mut config = PipelineConfig::translation("ds", "deepseek-chat", 1);
        config.providers.insert(
            "ds".into(),
            ProviderConfig {
                kind: ProviderKind::Openai,
                base_url: "https://api.deepseek.com".into(),
                api_key_env: Some("TET_WORKFLOW_TEST_UNSET_KEY".into()),
                organization: None,
                pricing: Pricing::default(),
            },
        );
        assert!(matches!(config.build(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tet.json");
        let config = PipelineConfig::translation("m", "model", 1);
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        assert_eq!(PipelineConfig::from_file(&path).unwrap(), config);

        let other = dir.path().join("tet.toml");
        std::fs::write(&other, "").unwrap();
        assert!(PipelineConfig::from_file(&other).is_err());
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn test_yaml_config() {
        let config = PipelineConfig::from_yaml_str(
            "name: tet\ninputs: [p]\nsteps:\n  - name: a\n    kind: initial_translation\n    provider: m\n    model: x\n    prompt: \"{p}\"\n",
        )
        .unwrap();
        assert_eq!(config.steps[0].name, "a");
    }
}
