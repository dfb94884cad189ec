//! Best-of-N selection over parallel candidates.
//!
//! The judge step sees every successful candidate, numbered from 1, in the
//! `{candidates}` placeholder (`{candidate_count}` holds how many). Its
//! verdict is read from a `<best_candidate>` section when present, otherwise
//! from the whole answer. A verdict without a clear number, including one
//! the judge never managed to produce, falls back to the first candidate
//! and is flagged [`AMBIGUOUS_JUDGMENT`].

use crate::context::ExecutionContext;
use crate::error::ErrorKind;
use crate::executor::StepExecutor;
use crate::output_parser::{
    parse_candidate_index, strip_think_tags, ParseError, BEST_CANDIDATE_FIELD,
};
use crate::result::{ParallelCandidateSet, SelectionRecord, StepResult, AMBIGUOUS_JUDGMENT};
use crate::step::StepSpec;
use crate::template::tagged_section;
use tracing::{debug, info, warn};

/// Context key holding the rendered candidate list.
pub const CANDIDATES_KEY: &str = "candidates";
/// Context key holding the number of judged candidates.
pub const CANDIDATE_COUNT_KEY: &str = "candidate_count";

/// A decided stage.
#[derive(Debug, Clone)]
pub struct Selection {
    pub record: SelectionRecord,
    /// The judge's own result. `None` when the judge was bypassed.
    pub judge: Option<StepResult>,
}

impl Selection {
    /// Branch index of the winning candidate.
    pub fn winner(&self) -> usize {
        self.record.winner
    }
}

/// Why no winner could be chosen.
#[derive(Debug, Clone)]
pub enum SelectionFailure {
    /// Every branch failed; there was nothing to judge.
    NoCandidates,
    /// The judge call itself failed after its retries (provider, transport
    /// or timeout). An unreadable answer is not a failure.
    JudgeFailed(StepResult),
}

/// Render the candidates as numbered sections.
///
/// Only `fields` are shown when non-empty; otherwise every parsed field.
///
/// ```
/// use std::collections::BTreeMap;
/// use tet_workflow::result::StepResult;
/// use tet_workflow::selection::render_candidates;
///
/// let mut a = StepResult::new("initial", "initial_translation", "mock", "m");
/// a.fields.insert("initial_translation".into(), "Moonlight".into());
/// let text = render_candidates(&[&a], &[]);
/// assert!(text.starts_with("<candidate_1>\n<initial_translation>\nMoonlight"));
/// ```
pub fn render_candidates(candidates: &[&StepResult], fields: &[String]) -> String {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let body: Vec<String> = c
                .fields
                .iter()
                .filter(|(name, _)| fields.is_empty() || fields.contains(name))
                .map(|(name, value)| tagged_section(name, value))
                .collect();
            tagged_section(&format!("candidate_{}", i + 1), &body.join("\n"))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Pick the best candidate of `set` using the `judge` step.
///
/// With a single successful candidate the judge is not called.
pub async fn select_best(
    executor: &StepExecutor,
    judge: &StepSpec,
    set: &ParallelCandidateSet,
    ctx: &ExecutionContext,
) -> Result<Selection, SelectionFailure> {
    let judged: Vec<(usize, &StepResult)> = set.successful().collect();
    let failed: Vec<usize> = set
        .candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.success)
        .map(|(i, c)| c.branch.unwrap_or(i))
        .collect();
    let branch_of = |pos: usize| judged[pos].1.branch.unwrap_or(judged[pos].0);

    if judged.is_empty() {
        warn!(stage = %set.step, "no successful candidates to judge");
        return Err(SelectionFailure::NoCandidates);
    }

    if judged.len() == 1 {
        debug!(stage = %set.step, "single candidate, judge bypassed");
        return Ok(Selection {
            record: SelectionRecord {
                stage: set.step.clone(),
                judge_step: judge.name.clone(),
                winner: branch_of(0),
                rejected: Vec::new(),
                failed,
                bypassed: true,
                critique: None,
                warning: None,
            },
            judge: None,
        });
    }

    let results: Vec<&StepResult> = judged.iter().map(|(_, c)| *c).collect();
    let mut judge_ctx = ctx.clone();
    judge_ctx.insert(
        CANDIDATES_KEY,
        render_candidates(&results, &judge.candidate_fields),
    );
    judge_ctx.insert(CANDIDATE_COUNT_KEY, judged.len().to_string());

    let mut verdict = executor.execute_step(judge, &judge_ctx).await;
    // An unparseable judgment is ambiguous, not fatal; only provider
    // failures fail the stage.
    let index = if verdict.success {
        let answer = verdict
            .field(BEST_CANDIDATE_FIELD)
            .filter(|v| !v.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| strip_think_tags(&verdict.raw_response));
        parse_candidate_index(&answer, judged.len())
    } else if verdict.error_kind() == Some(ErrorKind::Parse) {
        Err(ParseError::EmptyResponse)
    } else {
        return Err(SelectionFailure::JudgeFailed(verdict));
    };

    let (position, warning) = match index {
        Ok(pos) => (pos, None),
        Err(e) => {
            warn!(
                stage = %set.step,
                judge = %judge.name,
                error = %e,
                "ambiguous judgment, using first candidate"
            );
            verdict.warnings.push(AMBIGUOUS_JUDGMENT.to_string());
            (0, Some(AMBIGUOUS_JUDGMENT.to_string()))
        }
    };

    let winner = branch_of(position);
    let rejected = (0..judged.len())
        .filter(|&p| p != position)
        .map(branch_of)
        .collect();
    info!(stage = %set.step, winner, candidates = judged.len(), "candidate selected");

    Ok(Selection {
        record: SelectionRecord {
            stage: set.step.clone(),
            judge_step: judge.name.clone(),
            winner,
            rejected,
            failed,
            bypassed: false,
            critique: verdict.field("critique").map(str::to_string),
            warning,
        },
        judge: Some(verdict),
    })
}
