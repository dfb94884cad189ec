//! Step and run results.
//!
//! Everything here is `Serialize + Deserialize` so a run can be stored as a
//! JSON audit record and read back. Cost is a [`Decimal`], serialized as a
//! string to keep it exact.

use crate::context::ExecutionContext;
use crate::error::ErrorKind;
use crate::output_parser::ParseStrategy;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Token counts and cost of one or more provider calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: Decimal,
}

impl Usage {
    /// Token counts with zero cost.
    pub fn tokens(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cost: Decimal::ZERO,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens() == 0 && self.cost.is_zero()
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost += other.cost;
    }
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(mut self, other: Usage) -> Usage {
        self += other;
        self
    }
}

impl<'a> std::iter::Sum<&'a Usage> for Usage {
    fn sum<I: Iterator<Item = &'a Usage>>(iter: I) -> Usage {
        iter.fold(Usage::default(), |acc, u| acc + *u)
    }
}

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Last text the provider returned, if any call succeeded at the transport level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_raw_response: Option<String>,
}

/// Outcome of executing one step (or one branch of a parallel step).
///
/// `success` holds exactly when the response parsed and every required
/// field is present and non-empty; `failure` is set otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub kind: String,
    /// Branch index within a parallel stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<usize>,
    pub fields: BTreeMap<String, String>,
    pub raw_response: String,
    /// Reasoning captured from `<think>` blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Summed over every successful generation, retries included.
    pub usage: Usage,
    pub duration_ms: u64,
    pub model: String,
    pub provider: String,
    /// Provider calls made (≥ 1 unless the step failed before calling).
    pub attempts: u32,
    /// Time spent waiting between attempts.
    #[serde(default)]
    pub backoff_total_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    /// Which parse path produced `fields`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ParseStrategy>,
    /// Soft warnings (fallback parse, ambiguous judgment).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StepResult {
    /// An empty, not-yet-successful result for `step`.
    pub fn new(
        step: impl Into<String>,
        kind: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            step: step.into(),
            kind: kind.into(),
            branch: None,
            fields: BTreeMap::new(),
            raw_response: String::new(),
            thinking: None,
            usage: Usage::default(),
            duration_ms: 0,
            model: model.into(),
            provider: provider.into(),
            attempts: 0,
            backoff_total_ms: 0,
            success: false,
            failure: None,
            strategy: None,
            warnings: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// Mark failed, keeping whatever usage and raw text were collected.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.success = false;
        let last_raw_response = if self.raw_response.is_empty() {
            None
        } else {
            Some(self.raw_response.clone())
        };
        self.failure = Some(StepFailure {
            kind,
            message: message.into(),
            last_raw_response,
        });
    }
}

/// All branches of one parallel stage plus the context they started from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelCandidateSet {
    pub step: String,
    /// One result per branch, in branch order.
    pub candidates: Vec<StepResult>,
    pub input: ExecutionContext,
}

impl ParallelCandidateSet {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Successful candidates, with their positions in `candidates`.
    pub fn successful(&self) -> impl Iterator<Item = (usize, &StepResult)> {
        self.candidates.iter().enumerate().filter(|(_, c)| c.success)
    }
}

/// How a parallel stage's winner was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRecord {
    /// The parallel step whose candidates were judged.
    pub stage: String,
    /// The select step that judged them.
    pub judge_step: String,
    /// Branch index of the winner.
    pub winner: usize,
    /// Branch indices of the other successful candidates.
    pub rejected: Vec<usize>,
    /// Branch indices that failed and were never judged.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<usize>,
    /// True when only one candidate was available and no judge was called.
    pub bypassed: bool,
    /// Judge's explanation, when it gave one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique: Option<String>,
    /// Set when the judgment had no clear index and the first candidate won.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Soft warning label for an unreadable judgment.
pub const AMBIGUOUS_JUDGMENT: &str = "ambiguous_judgment";
/// Soft warning attached when only the fallback scan recovered the fields.
pub const FALLBACK_PARSE: &str = "fallback_parse";

/// Non-fatal issues collected over a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RunWarning {
    /// The judge did not name a clear winner; the first candidate was used.
    AmbiguousJudgment { step: String },
    /// The strict parser failed and fields were recovered best-effort.
    FallbackParse { step: String },
    /// An optional step failed and was skipped.
    OptionalStepFailed { step: String, kind: ErrorKind },
    /// Some branches of a parallel stage failed; the rest were judged.
    CandidatesFailed { step: String, branches: Vec<usize> },
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// A required step failed; later steps did not run.
    Failed { step: String },
    /// The cancellation flag was raised before `step` started.
    Cancelled { step: String },
}

/// Aggregates over every step result of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub usage: Usage,
    /// Sum of step durations (parallel branches counted individually).
    pub step_duration_ms: u64,
    /// Wall-clock duration of the run.
    pub wall_duration_ms: u64,
    pub attempts: u32,
}

impl RunTotals {
    pub fn from_steps(steps: &[StepResult]) -> Self {
        Self {
            usage: steps.iter().map(|s| &s.usage).sum(),
            step_duration_ms: steps.iter().map(|s| s.duration_ms).sum(),
            wall_duration_ms: 0,
            attempts: steps.iter().map(|s| s.attempts).sum(),
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunResult {
    pub run_id: Uuid,
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Results in execution order. Parallel branches appear in branch order,
    /// followed by the judge's result.
    pub steps: Vec<StepResult>,
    pub selections: Vec<SelectionRecord>,
    pub totals: RunTotals,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<RunWarning>,
    /// Context after the last executed step.
    pub context: ExecutionContext,
}

impl PipelineRunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Result for `name`. For a parallel step this is the selected winner.
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        if let Some(sel) = self.selection(name) {
            return self
                .steps
                .iter()
                .find(|s| s.step == name && s.branch == Some(sel.winner));
        }
        self.steps.iter().find(|s| s.step == name)
    }

    /// Every result recorded under `name` (all branches of a parallel step).
    pub fn results_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a StepResult> + 'a {
        self.steps.iter().filter(move |s| s.step == name)
    }

    pub fn selection(&self, stage: &str) -> Option<&SelectionRecord> {
        self.selections.iter().find(|s| s.stage == stage)
    }

    pub fn total_tokens(&self) -> u64 {
        self.totals.usage.total_tokens()
    }

    pub fn total_cost(&self) -> Decimal {
        self.totals.usage.cost
    }

    /// Context value by key, e.g. `"revise.revised_translation"`.
    pub fn output(&self, key: &str) -> Option<&str> {
        self.context.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_result(step: &str, branch: Option<usize>, p: u64, c: u64) -> StepResult {
        let mut r = StepResult::new(step, "initial_translation", "mock", "m");
        r.branch = branch;
        r.success = true;
        r.attempts = 1;
        r.usage = Usage::tokens(p, c);
        r
    }

    #[test]
    fn test_usage_sums() {
        let mut a = Usage::tokens(10, 5);
        a.cost = "0.01".parse().unwrap();
        let mut b = Usage::tokens(1, 2);
        b.cost = "0.02".parse().unwrap();
        let total: Usage = [a, b].iter().sum();
        assert_eq!(total.total_tokens(), 18);
        assert_eq!(total.cost, "0.03".parse::<Decimal>().unwrap());
    }

    #[test]
    fn test_cost_serializes_as_string() {
        let mut u = Usage::tokens(1, 1);
        u.cost = "0.00164".parse().unwrap();
        let json = serde_json::to_value(u).unwrap();
        assert_eq!(json["cost"], "0.00164");
    }

    #[test]
    fn test_fail_keeps_raw_response() {
        let mut r = StepResult::new("review", "editor_review", "mock", "m");
        r.raw_response = "no tags here".into();
        r.fail(ErrorKind::Parse, "missing required sections: editor_suggestions");
        assert!(!r.is_success());
        let failure = r.failure.as_ref().unwrap();
        assert_eq!(failure.kind, ErrorKind::Parse);
        assert_eq!(failure.last_raw_response.as_deref(), Some("no tags here"));
    }

    #[test]
    fn test_run_result_lookup_and_round_trip() {
        let steps = vec![
            ok_result("initial", Some(0), 100, 50),
            ok_result("initial", Some(1), 100, 60),
            ok_result("evaluate", None, 30, 10),
        ];
        let run = PipelineRunResult {
            run_id: Uuid::new_v4(),
            pipeline: "tet".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            totals: RunTotals::from_steps(&steps),
            steps,
            selections: vec![SelectionRecord {
                stage: "initial".into(),
                judge_step: "evaluate".into(),
                winner: 1,
                rejected: vec![0],
                failed: vec![],
                bypassed: false,
                critique: None,
                warning: None,
            }],
            status: RunStatus::Failed {
                step: "revise".into(),
            },
            warnings: vec![RunWarning::OptionalStepFailed {
                step: "polish".into(),
                kind: ErrorKind::ProviderTimeout,
            }],
            context: ExecutionContext::new().with("original_poem", "静夜思"),
        };

        assert_eq!(run.total_tokens(), 350);
        assert_eq!(run.totals.attempts, 3);
        assert_eq!(run.step("initial").unwrap().branch, Some(1));
        assert_eq!(run.results_for("initial").count(), 2);
        assert!(!run.is_success());

        let json = serde_json::to_string(&run).unwrap();
        let back: PipelineRunResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
    }
}
