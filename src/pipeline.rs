//! Pipeline orchestrator.
//!
//! A [`Pipeline`] runs its steps in declaration order against one
//! [`ExecutionContext`]. A step with a parallel spec fans out into N branches
//! that run concurrently on clones of the context; the select step that
//! follows it picks a winner, whose fields are merged under the parallel
//! step's namespace. A failed required step halts the run; a failed
//! optional step is recorded and skipped.
//!
//! ```text
//!  Pending ──► Running(0) ──► Running(1) ──► ... ──► Completed
//!                  │               │
//!                  └───────────────┴──► Failed(i) / Cancelled(i)
//! ```

use crate::backend::ProviderRegistry;
use crate::config::validate_steps;
use crate::context::ExecutionContext;
use crate::error::{ErrorKind, Result};
use crate::events::{emit, MilestoneTracker, ProgressEvent, ProgressKind, ProgressSink};
use crate::executor::StepExecutor;
use crate::output_parser::ParserRegistry;
use crate::persistence::{NullSink, RunSink};
use crate::result::{
    ParallelCandidateSet, PipelineRunResult, RunStatus, RunTotals, RunWarning, SelectionRecord,
    StepResult, AMBIGUOUS_JUDGMENT, FALLBACK_PARSE,
};
use crate::selection::{select_best, SelectionFailure};
use crate::step::{StepRole, StepSpec};
use chrono::Utc;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    /// Executing the step at this index.
    Running(usize),
    Completed,
    /// The required step at this index failed.
    Failed(usize),
    /// Cancellation was observed at this step index.
    Cancelled(usize),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed(_) | RunState::Cancelled(_)
        )
    }
}

/// A validated, runnable workflow.
pub struct Pipeline {
    name: String,
    steps: Vec<StepSpec>,
    executor: StepExecutor,
    sink: Arc<dyn RunSink>,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|s| &s.name).collect::<Vec<_>>(),
            )
            .field("cancelled", &self.cancel.load(Ordering::Relaxed))
            .finish()
    }
}

/// Mutable state of one run.
struct RunProgress {
    ctx: ExecutionContext,
    steps: Vec<StepResult>,
    selections: Vec<SelectionRecord>,
    warnings: Vec<RunWarning>,
    state: RunState,
    status: RunStatus,
}

impl Pipeline {
    /// Create a new pipeline builder.
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    /// Flag that stops the run before the next step or attempt.
    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Run every step against `inputs`.
    ///
    /// Never fails: configuration problems were rejected by the builder, and
    /// everything that goes wrong at runtime is recorded in the result.
    pub async fn run(&self, inputs: ExecutionContext) -> PipelineRunResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let wall = Instant::now();
        info!(pipeline = %self.name, %run_id, steps = self.steps.len(), "run started");

        let mut run = RunProgress {
            ctx: inputs,
            steps: Vec::new(),
            selections: Vec::new(),
            warnings: Vec::new(),
            state: RunState::Pending,
            status: RunStatus::Completed,
        };

        let mut i = 0;
        while i < self.steps.len() {
            let spec = &self.steps[i];
            if self.is_cancelled() {
                run.state = RunState::Cancelled(i);
                run.status = RunStatus::Cancelled {
                    step: spec.name.clone(),
                };
                break;
            }
            run.state = RunState::Running(i);

            let judge = self
                .steps
                .get(i + 1)
                .filter(|next| next.role == StepRole::Select);
            let advance = match (spec.parallel.is_some(), judge) {
                (true, Some(judge)) => {
                    self.run_parallel(run_id, i, spec, judge, &mut run).await;
                    2
                }
                _ => {
                    self.run_sequential(run_id, i, spec, &mut run).await;
                    1
                }
            };
            if run.state.is_terminal() {
                break;
            }
            i += advance;
        }

        if !run.state.is_terminal() {
            run.state = RunState::Completed;
        }

        let mut totals = RunTotals::from_steps(&run.steps);
        totals.wall_duration_ms = wall.elapsed().as_millis() as u64;

        let result = PipelineRunResult {
            run_id,
            pipeline: self.name.clone(),
            started_at,
            finished_at: Utc::now(),
            steps: run.steps,
            selections: run.selections,
            totals,
            status: run.status,
            warnings: run.warnings,
            context: run.ctx,
        };

        info!(
            pipeline = %self.name,
            %run_id,
            status = ?result.status,
            tokens = result.total_tokens(),
            cost = %result.total_cost(),
            "run finished"
        );
        if let Err(e) = self.sink.record_run(&result).await {
            warn!(%run_id, error = %e, "failed to persist run");
        }
        result
    }

    async fn record(&self, run_id: Uuid, result: &StepResult) {
        if let Err(e) = self.sink.record_step(run_id, result).await {
            warn!(%run_id, step = %result.step, error = %e, "failed to persist step result");
        }
    }

    /// Required failure halts; optional failure becomes a warning.
    fn apply_failure(
        &self,
        index: usize,
        spec: &StepSpec,
        kind: Option<ErrorKind>,
        run: &mut RunProgress,
    ) {
        if kind == Some(ErrorKind::Cancelled) {
            run.state = RunState::Cancelled(index);
            run.status = RunStatus::Cancelled {
                step: spec.name.clone(),
            };
        } else if spec.required {
            run.state = RunState::Failed(index);
            run.status = RunStatus::Failed {
                step: spec.name.clone(),
            };
        } else {
            warn!(step = %spec.name, ?kind, "optional step failed, continuing");
            run.warnings.push(RunWarning::OptionalStepFailed {
                step: spec.name.clone(),
                kind: kind.unwrap_or(ErrorKind::Other),
            });
        }
    }

    async fn run_sequential(
        &self,
        run_id: Uuid,
        index: usize,
        spec: &StepSpec,
        run: &mut RunProgress,
    ) {
        let result = self.executor.execute_step(spec, &run.ctx).await;
        self.record(run_id, &result).await;

        if result.success {
            run.ctx.merge_fields(spec.namespace(), &spec.aliases, &result.fields);
            if result.warnings.iter().any(|w| w == FALLBACK_PARSE) {
                run.warnings.push(RunWarning::FallbackParse {
                    step: spec.name.clone(),
                });
            }
        } else {
            self.apply_failure(index, spec, result.error_kind(), run);
        }
        run.steps.push(result);
    }

    /// Fan out `spec`, then let `judge` pick the winner.
    async fn run_parallel(
        &self,
        run_id: Uuid,
        index: usize,
        spec: &StepSpec,
        judge: &StepSpec,
        run: &mut RunProgress,
    ) {
        let set = self.fan_out(run_id, spec, &run.ctx).await;
        run.steps.extend(set.candidates.iter().cloned());

        let failed: Vec<usize> = set
            .candidates
            .iter()
            .filter(|c| !c.success)
            .filter_map(|c| c.branch)
            .collect();
        if !failed.is_empty() && failed.len() < set.len() {
            run.warnings.push(RunWarning::CandidatesFailed {
                step: spec.name.clone(),
                branches: failed,
            });
        }
        if set
            .candidates
            .iter()
            .any(|c| c.warnings.iter().any(|w| w == FALLBACK_PARSE))
        {
            run.warnings.push(RunWarning::FallbackParse {
                step: spec.name.clone(),
            });
        }

        let record = match select_best(&self.executor, judge, &set, &run.ctx).await {
            Ok(selection) => {
                if let Some(verdict) = selection.judge {
                    self.record(run_id, &verdict).await;
                    run.ctx
                        .merge_fields(judge.namespace(), &judge.aliases, &verdict.fields);
                    run.steps.push(verdict);
                }
                selection.record
            }
            Err(SelectionFailure::NoCandidates) => {
                let kind = set.candidates.last().and_then(StepResult::error_kind);
                self.apply_failure(index, spec, kind, run);
                return;
            }
            Err(SelectionFailure::JudgeFailed(verdict)) => {
                self.record(run_id, &verdict).await;
                let kind = verdict.error_kind();
                run.steps.push(verdict);
                self.apply_failure(index + 1, judge, kind, run);
                if run.state.is_terminal() {
                    return;
                }
                // optional judge: the first successful candidate stands
                let mut successful = set.successful().filter_map(|(_, c)| c.branch);
                let Some(winner) = successful.next() else {
                    return;
                };
                SelectionRecord {
                    stage: spec.name.clone(),
                    judge_step: judge.name.clone(),
                    winner,
                    rejected: successful.collect(),
                    failed: set
                        .candidates
                        .iter()
                        .filter(|c| !c.success)
                        .filter_map(|c| c.branch)
                        .collect(),
                    bypassed: false,
                    critique: None,
                    warning: Some("judge_failed".to_string()),
                }
            }
        };

        if record.warning.as_deref() == Some(AMBIGUOUS_JUDGMENT) {
            run.warnings.push(RunWarning::AmbiguousJudgment {
                step: judge.name.clone(),
            });
        }
        if let Some(winner) = set
            .candidates
            .iter()
            .find(|c| c.branch == Some(record.winner))
        {
            run.ctx
                .merge_fields(spec.namespace(), &spec.aliases, &winner.fields);
        }
        run.selections.push(record);
    }

    /// Run every branch of `spec` concurrently on its own context clone.
    ///
    /// The stage reports one `Started`, the milestone `Progress` events and
    /// one `Completed` (any branch succeeded) or `Failed`.
    async fn fan_out(
        &self,
        run_id: Uuid,
        spec: &StepSpec,
        ctx: &ExecutionContext,
    ) -> ParallelCandidateSet {
        let count = spec.parallel_count().max(1);
        let tracker = MilestoneTracker::new(count);
        let progress = self.executor.progress();
        info!(step = %spec.name, branches = count, "fanning out");
        emit(
            progress,
            ProgressEvent::new(&spec.name, ProgressKind::Started)
                .with_detail(format!("{} branches", count)),
        );

        let branches = (0..count).map(|b| {
            let branch_ctx = ctx.clone();
            let tracker = &tracker;
            async move {
                let result = self.executor.execute_branch(spec, &branch_ctx, b).await;
                self.record(run_id, &result).await;
                if let Some(percent) = tracker.complete_one() {
                    emit(
                        progress,
                        ProgressEvent::new(&spec.name, ProgressKind::Progress)
                            .with_percent(percent),
                    );
                }
                result
            }
        });
        let candidates = join_all(branches).await;

        let succeeded = candidates.iter().filter(|c| c.success).count();
        let finished = if succeeded > 0 {
            ProgressEvent::new(&spec.name, ProgressKind::Completed)
        } else {
            ProgressEvent::new(&spec.name, ProgressKind::Failed)
        };
        emit(
            progress,
            finished.with_detail(format!("{}/{} branches succeeded", succeeded, count)),
        );

        ParallelCandidateSet {
            step: spec.name.clone(),
            candidates,
            input: ctx.clone(),
        }
    }
}

/// Builder for [`Pipeline`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tet_workflow::backend::{MockBackend, ProviderRegistry};
/// use tet_workflow::pipeline::Pipeline;
/// use tet_workflow::step::StepSpec;
///
/// let providers = ProviderRegistry::new()
///     .with_provider("mock", Arc::new(MockBackend::fixed("...")), "http://unused");
/// let pipeline = Pipeline::builder("tet")
///     .input("original_poem")
///     .providers(providers)
///     .step(StepSpec::new("initial", "initial_translation", "mock", "m", "Translate: {original_poem}"))
///     .build()
///     .unwrap();
/// assert_eq!(pipeline.steps().len(), 1);
/// ```
pub struct PipelineBuilder {
    name: String,
    inputs: Vec<String>,
    steps: Vec<StepSpec>,
    providers: ProviderRegistry,
    parsers: ParserRegistry,
    progress: Option<Arc<dyn ProgressSink>>,
    sink: Arc<dyn RunSink>,
    cancel: Option<Arc<AtomicBool>>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            steps: Vec::new(),
            providers: ProviderRegistry::new(),
            parsers: ParserRegistry::with_builtins(),
            progress: None,
            sink: Arc::new(NullSink),
            cancel: None,
        }
    }

    /// Declare a caller-supplied context variable.
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = StepSpec>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    /// Replace the parser registry (defaults to the built-in step kinds).
    pub fn parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Share an externally owned cancellation flag.
    pub fn cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Validate the steps and build the pipeline.
    pub fn build(self) -> Result<Pipeline> {
        validate_steps(&self.steps, &self.inputs, &self.providers, &self.parsers)?;

        let cancel = self
            .cancel
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
        let mut executor = StepExecutor::new(Arc::new(self.providers), Arc::new(self.parsers))
            .with_cancellation(cancel.clone());
        if let Some(progress) = self.progress {
            executor = executor.with_progress(progress);
        }

        Ok(Pipeline {
            name: self.name,
            steps: self.steps,
            executor,
            sink: self.sink,
            cancel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackoffConfig, MockBackend, MockReply};
    use crate::events::CollectingSink;
    use crate::retry::RetryPolicy;

    fn fast(spec: StepSpec) -> StepSpec {
        spec.with_retry(RetryPolicy::new(2).with_backoff(BackoffConfig::none()))
    }

    fn initial() -> StepSpec {
        fast(StepSpec::new(
            "initial",
            "initial_translation",
            "translator",
            "t",
            "Translate {original_poem}",
        ))
    }

    fn review() -> StepSpec {
        fast(StepSpec::new(
            "review",
            "editor_review",
            "editor",
            "e",
            "Review {initial.initial_translation}",
        ))
    }

    const T1: &str = "<initial_translation>Moonlight</initial_translation><initial_translation_notes>n</initial_translation_notes>";
    const R1: &str = "<editor_suggestions>1. Add frost</editor_suggestions>";

    fn providers(translator: MockBackend, editor: MockBackend) -> ProviderRegistry {
        ProviderRegistry::new()
            .with_provider("translator", Arc::new(translator), "http://unused")
            .with_provider("editor", Arc::new(editor), "http://unused")
    }

    #[tokio::test]
    async fn test_sequential_steps_thread_context() {
        let editor = MockBackend::fixed(R1);
        let pipeline = Pipeline::builder("t")
            .input("original_poem")
            .providers(providers(MockBackend::fixed(T1), editor))
            .steps([initial(), review()])
            .build()
            .unwrap();
        let run = pipeline
            .run(ExecutionContext::new().with("original_poem", "静夜思"))
            .await;
        assert!(run.is_success());
        assert_eq!(run.steps.len(), 2);
        assert_eq!(run.output("review.editor_suggestions"), Some("1. Add frost"));
    }

    #[tokio::test]
    async fn test_optional_failure_continues() {
        let pipeline = Pipeline::builder("t")
            .input("original_poem")
            .providers(providers(
                MockBackend::fixed(T1),
                MockBackend::new(vec![MockReply::rejected("quota exhausted")]),
            ))
            .steps([initial(), review().optional()])
            .build()
            .unwrap();
        let run = pipeline
            .run(ExecutionContext::new().with("original_poem", "静夜思"))
            .await;
        assert!(run.is_success());
        assert_eq!(
            run.warnings,
            vec![RunWarning::OptionalStepFailed {
                step: "review".into(),
                kind: ErrorKind::Provider
            }]
        );
    }

    #[tokio::test]
    async fn test_cancellation_before_start() {
        let pipeline = Pipeline::builder("t")
            .input("original_poem")
            .providers(providers(MockBackend::fixed(T1), MockBackend::fixed(R1)))
            .steps([initial(), review()])
            .build()
            .unwrap();
        pipeline.cancel();
        let run = pipeline
            .run(ExecutionContext::new().with("original_poem", "静夜思"))
            .await;
        assert_eq!(
            run.status,
            RunStatus::Cancelled {
                step: "initial".into()
            }
        );
        assert!(run.steps.is_empty());
    }

    #[tokio::test]
    async fn test_parallel_milestones_emitted() {
        let sink = Arc::new(CollectingSink::new());
        let judge = StepSpec::selector("evaluate", "editor", "j", "{candidates}");
        let pipeline = Pipeline::builder("t")
            .input("original_poem")
            .providers(providers(
                MockBackend::fixed(T1),
                MockBackend::fixed("<best_candidate>3</best_candidate>"),
            ))
            .progress(sink.clone())
            .steps([initial().with_parallel(3, vec![]), judge])
            .build()
            .unwrap();
        let run = pipeline
            .run(ExecutionContext::new().with("original_poem", "静夜思"))
            .await;
        assert!(run.is_success());
        let percents: Vec<u8> = sink
            .of_kind(ProgressKind::Progress)
            .iter()
            .filter_map(|e| e.percent)
            .collect();
        assert_eq!(percents, vec![33, 66, 100]);
        assert_eq!(run.selection("initial").unwrap().winner, 2);

        // the stage reports once, not once per branch
        let stage: Vec<(ProgressKind, Option<u8>)> = sink
            .events()
            .into_iter()
            .filter(|e| e.step == "initial")
            .map(|e| (e.kind, e.percent))
            .collect();
        assert_eq!(
            stage,
            vec![
                (ProgressKind::Started, None),
                (ProgressKind::Progress, Some(33)),
                (ProgressKind::Progress, Some(66)),
                (ProgressKind::Progress, Some(100)),
                (ProgressKind::Completed, None),
            ]
        );
    }

    #[test]
    fn test_run_state_terminal() {
        assert!(!RunState::Pending.is_terminal());
        assert!(!RunState::Running(2).is_terminal());
        assert!(RunState::Failed(1).is_terminal());
        assert!(RunState::Completed.is_terminal());
    }
}
