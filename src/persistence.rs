//! Persistence sink for step and run results.
//!
//! The orchestrator hands every [`StepResult`] to a [`RunSink`] as soon as it
//! completes, and the final [`PipelineRunResult`] once the run ends. Storage
//! is the caller's concern; the crate ships a no-op sink, an in-memory sink
//! and a JSON file sink. Sink errors are logged and never fail the run.

use crate::result::{PipelineRunResult, StepResult};
use anyhow::Context as _;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Receiver for results as a run progresses.
#[async_trait]
pub trait RunSink: Send + Sync {
    /// Called once per finished step or branch, in completion order.
    async fn record_step(&self, run_id: Uuid, result: &StepResult) -> anyhow::Result<()>;

    /// Called once with the final result.
    async fn record_run(&self, run: &PipelineRunResult) -> anyhow::Result<()>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl RunSink for NullSink {
    async fn record_step(&self, _run_id: Uuid, _result: &StepResult) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_run(&self, _run: &PipelineRunResult) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps results in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    steps: Mutex<Vec<(Uuid, StepResult)>>,
    runs: Mutex<Vec<PipelineRunResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> Vec<(Uuid, StepResult)> {
        self.steps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn runs(&self) -> Vec<PipelineRunResult> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl RunSink for MemorySink {
    async fn record_step(&self, run_id: Uuid, result: &StepResult) -> anyhow::Result<()> {
        self.steps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((run_id, result.clone()));
        Ok(())
    }

    async fn record_run(&self, run: &PipelineRunResult) -> anyhow::Result<()> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(run.clone());
        Ok(())
    }
}

/// Writes `<dir>/<run_id>.json` when a run finishes.
///
/// With [`with_step_journal`](Self::with_step_journal), each step result is
/// also appended as one JSON line to `<dir>/<run_id>.steps.jsonl` while the
/// run is in progress, so a crashed run still leaves a trail.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
    journal: bool,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            journal: false,
        }
    }

    pub fn with_step_journal(mut self) -> Self {
        self.journal = true;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the final run record.
    pub fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    pub fn journal_path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.steps.jsonl", run_id))
    }

    /// Read a stored run back.
    pub async fn load(&self, run_id: Uuid) -> anyhow::Result<PipelineRunResult> {
        let path = self.run_path(run_id);
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("decoding {}", path.display()))
    }
}

#[async_trait]
impl RunSink for JsonFileSink {
    async fn record_step(&self, run_id: Uuid, result: &StepResult) -> anyhow::Result<()> {
        if !self.journal {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.journal_path(run_id);
        let mut line = serde_json::to_string(result)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn record_run(&self, run: &PipelineRunResult) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.run_path(run.run_id);
        let json = serde_json::to_vec_pretty(run)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::result::{RunStatus, RunTotals};
    use chrono::Utc;

    fn run() -> PipelineRunResult {
        let mut step = StepResult::new("initial", "initial_translation", "mock", "m");
        step.success = true;
        step.fields.insert("initial_translation".into(), "Moonlight".into());
        let steps = vec![step];
        PipelineRunResult {
            run_id: Uuid::new_v4(),
            pipeline: "tet".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            totals: RunTotals::from_steps(&steps),
            steps,
            selections: vec![],
            status: RunStatus::Completed,
            warnings: vec![],
            context: ExecutionContext::new(),
        }
    }

    #[tokio::test]
    async fn test_json_file_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path().join("runs"));
        let run = run();
        sink.record_run(&run).await.unwrap();
        assert!(sink.run_path(run.run_id).exists());
        let back = sink.load(run.run_id).await.unwrap();
        assert_eq!(back, run);
    }

    #[tokio::test]
    async fn test_json_file_sink_journal() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path()).with_step_journal();
        let run = run();
        sink.record_step(run.run_id, &run.steps[0]).await.unwrap();
        sink.record_step(run.run_id, &run.steps[0]).await.unwrap();
        let text = std::fs::read_to_string(sink.journal_path(run.run_id)).unwrap();
        assert_eq!(text.lines().count(), 2);
        let first: StepResult = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first.step, "initial");
    }

    #[tokio::test]
    async fn test_journal_disabled_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path());
        let run = run();
        sink.record_step(run.run_id, &run.steps[0]).await.unwrap();
        assert!(!sink.journal_path(run.run_id).exists());
    }

    #[tokio::test]
    async fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        let run = run();
        sink.record_step(run.run_id, &run.steps[0]).await.unwrap();
        sink.record_run(&run).await.unwrap();
        assert_eq!(sink.steps().len(), 1);
        assert_eq!(sink.runs()[0].run_id, run.run_id);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path());
        let res = tokio_test::block_on(sink.load(Uuid::new_v4()));
        assert!(res.unwrap_err().to_string().starts_with("reading"));
    }
}
