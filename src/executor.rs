//! Step executor: render, generate with retry, parse, validate.
//!
//! [`StepExecutor::execute_step`] never returns an error. Every outcome,
//! including a bad template or an unknown provider, is a [`StepResult`]
//! whose `failure` says what went wrong; the orchestrator decides whether
//! that halts the run.

use crate::backend::{ChatMessage, LlmRequest, ProviderBinding, ProviderRegistry};
use crate::context::ExecutionContext;
use crate::error::{ErrorKind, PipelineError};
use crate::events::{emit, ProgressEvent, ProgressKind, ProgressSink};
use crate::output_parser::{
    extract_thinking, OutputSchema, ParseError, ParseStrategy, ParserRegistry,
};
use crate::result::{StepResult, FALLBACK_PARSE};
use crate::step::StepSpec;
use crate::template::render;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Temperature drop per parse retry when the policy enables cool-down.
const COOL_DOWN_STEP: f64 = 0.2;

/// Executes single steps against registered providers.
///
/// Cheap to clone; parallel branches share one executor.
#[derive(Clone)]
pub struct StepExecutor {
    providers: Arc<ProviderRegistry>,
    parsers: Arc<ParserRegistry>,
    progress: Option<Arc<dyn ProgressSink>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("providers", &self.providers.names())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Rendered prompts for one step.
struct Rendered {
    system: Option<String>,
    prompt: String,
}

impl StepExecutor {
    pub fn new(providers: Arc<ProviderRegistry>, parsers: Arc<ParserRegistry>) -> Self {
        Self {
            providers,
            parsers,
            progress: None,
            cancel: None,
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Abort between attempts once `flag` is set.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn parsers(&self) -> &ParserRegistry {
        &self.parsers
    }

    pub(crate) fn progress(&self) -> &Option<Arc<dyn ProgressSink>> {
        &self.progress
    }

    /// Branches of a parallel stage report through the stage; only
    /// sequential steps emit their own lifecycle events.
    fn notify(&self, branch: Option<usize>, event: ProgressEvent) {
        if branch.is_none() {
            emit(&self.progress, event);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Execute a sequential step.
    pub async fn execute_step(&self, spec: &StepSpec, ctx: &ExecutionContext) -> StepResult {
        self.execute(spec, ctx, None).await
    }

    /// Execute branch `index` of a parallel step, applying its overrides.
    pub async fn execute_branch(
        &self,
        spec: &StepSpec,
        ctx: &ExecutionContext,
        index: usize,
    ) -> StepResult {
        self.execute(&spec.branch(index), ctx, Some(index)).await
    }

    async fn execute(
        &self,
        spec: &StepSpec,
        ctx: &ExecutionContext,
        branch: Option<usize>,
    ) -> StepResult {
        let start = Instant::now();
        let mut result = StepResult::new(&spec.name, &spec.kind, &spec.provider, &spec.model);
        result.branch = branch;

        self.notify(branch, ProgressEvent::new(&spec.name, ProgressKind::Started));
        debug!(step = %spec.name, ?branch, model = %spec.model, "step started");

        match self.prepare(spec, ctx) {
            Ok((rendered, binding, schema)) => {
                self.run_attempts(spec, &rendered, binding, schema, &mut result)
                    .await;
            }
            Err(e) => result.fail(e.kind(), e.to_string()),
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        self.finish(&result);
        result
    }

    /// Everything that can fail before the first provider call.
    fn prepare<'a>(
        &'a self,
        spec: &StepSpec,
        ctx: &ExecutionContext,
    ) -> crate::error::Result<(Rendered, &'a ProviderBinding, &'a OutputSchema)> {
        let system = spec
            .system
            .as_deref()
            .map(|t| render(t, &spec.name, ctx))
            .transpose()?;
        let prompt = render(&spec.prompt, &spec.name, ctx)?;
        let binding = self.providers.get(&spec.provider).ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}' uses unknown provider '{}'",
                spec.name, spec.provider
            ))
        })?;
        let schema = self.parsers.get(&spec.kind).ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': {}",
                spec.name,
                ParseError::UnknownKind(spec.kind.clone())
            ))
        })?;
        Ok((Rendered { system, prompt }, binding, schema))
    }

    async fn run_attempts(
        &self,
        spec: &StepSpec,
        rendered: &Rendered,
        binding: &ProviderBinding,
        schema: &OutputSchema,
        result: &mut StepResult,
    ) {
        let policy = &spec.retry;
        let max_attempts = policy.attempts();
        let mut history: Vec<ChatMessage> = Vec::new();
        let mut temperature = spec.params.temperature;
        let mut last_error: Option<PipelineError> = None;

        for attempt in 0..max_attempts {
            if self.is_cancelled() {
                result.fail(ErrorKind::Cancelled, PipelineError::Cancelled.to_string());
                return;
            }

            if let Some(ref err) = last_error {
                let delay = policy.delay_after(attempt - 1, err);
                warn!(
                    step = %spec.name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying step"
                );
                self.notify(
                    result.branch,
                    ProgressEvent::new(&spec.name, ProgressKind::Retrying).with_detail(format!(
                        "attempt {}/{}: {}",
                        attempt + 1,
                        max_attempts,
                        err
                    )),
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                result.backoff_total_ms += delay.as_millis() as u64;
            }

            let mut params = spec.params.clone();
            params.temperature = temperature;
            let request = LlmRequest {
                model: spec.model.clone(),
                system_prompt: rendered.system.clone(),
                prompt: rendered.prompt.clone(),
                messages: history.clone(),
                params,
            };

            result.attempts += 1;
            let call = binding.generate(self.providers.client(), &request);
            let outcome = match tokio::time::timeout(spec.params.timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(PipelineError::ProviderTimeout(spec.params.timeout)),
            };

            let err = match outcome {
                Ok(response) => {
                    result.usage += response.usage;
                    result.raw_response = response.text;
                    match Self::parse(schema, &result.raw_response) {
                        Ok(parsed) => {
                            result.fields = parsed.fields;
                            result.thinking = parsed.thinking;
                            result.strategy = Some(parsed.strategy);
                            if parsed.strategy == ParseStrategy::Fallback {
                                result.warnings.push(FALLBACK_PARSE.to_string());
                            }
                            result.success = true;
                            result.failure = None;
                            return;
                        }
                        Err(parse_err) => {
                            result.thinking = extract_thinking(&result.raw_response).0;
                            if policy.retry_on_parse_error && policy.parse_feedback {
                                if history.is_empty() {
                                    history.push(ChatMessage::user(rendered.prompt.clone()));
                                }
                                history.push(ChatMessage::assistant(result.raw_response.clone()));
                                let correction = correction_message(&parse_err, schema);
                                history.push(ChatMessage::user(correction));
                            }
                            if policy.cool_down {
                                temperature = (temperature - COOL_DOWN_STEP).max(0.0);
                            }
                            PipelineError::Parse(parse_err)
                        }
                    }
                }
                Err(e) => e,
            };

            let exhausted = attempt + 1 >= max_attempts;
            if exhausted || !policy.is_retryable(&err) {
                result.fail(err.kind(), err.to_string());
                return;
            }
            last_error = Some(err);
        }
    }

    /// Schema parse plus the required-field check, so custom parse
    /// functions cannot report success with required sections missing.
    fn parse(
        schema: &OutputSchema,
        raw: &str,
    ) -> Result<crate::output_parser::ParsedOutput, ParseError> {
        let parsed = schema.parse(raw)?;
        let missing = schema.missing_required(&parsed.fields);
        if missing.is_empty() {
            Ok(parsed)
        } else {
            Err(ParseError::MissingFields { fields: missing })
        }
    }

    fn finish(&self, result: &StepResult) {
        let mut event = ProgressEvent::new(
            &result.step,
            if result.success {
                ProgressKind::Completed
            } else {
                ProgressKind::Failed
            },
        );
        match &result.failure {
            Some(failure) => {
                warn!(
                    step = %result.step,
                    branch = ?result.branch,
                    attempts = result.attempts,
                    kind = ?failure.kind,
                    "step failed: {}", failure.message
                );
                event = event.with_detail(failure.message.clone());
            }
            None => {
                info!(
                    step = %result.step,
                    branch = ?result.branch,
                    attempts = result.attempts,
                    tokens = result.usage.total_tokens(),
                    duration_ms = result.duration_ms,
                    "step completed"
                );
            }
        }
        self.notify(result.branch, event);
    }
}

/// The user turn appended after an unparseable answer.
fn correction_message(err: &ParseError, schema: &OutputSchema) -> String {
    let sections: Vec<String> = schema
        .required
        .iter()
        .map(|name| format!("<{0}>...</{0}>", name))
        .collect();
    format!(
        "Your previous response was invalid: {}. \
         Please try again, wrapping each section in its tags: {}.",
        err,
        sections.join(", ")
    )
}
