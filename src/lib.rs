//! # T-E-T Workflow
//!
//! Orchestration core for Translator → Editor → Translator poetry
//! translation with LLMs.
//!
//! A workflow is an ordered list of steps. Each step renders a prompt from
//! the run's context, calls a provider, and parses the model's XML-tagged
//! answer into named fields that later steps can reference. A step may fan
//! out into several parallel candidates; the judge step that follows picks
//! the best one.
//!
//! ## Core Concepts
//!
//! - **[`StepSpec`]**: one step's prompt, provider, model, retry policy and
//!   output kind.
//! - **[`StepExecutor`]**: render → generate with retry and backoff →
//!   parse → validate. Always yields a [`StepResult`].
//! - **[`Pipeline`]**: runs the steps, fans out parallel stages, routes
//!   candidates to [`selection::select_best`], and applies the
//!   required/optional failure policy.
//! - **[`ParserRegistry`]**: step kind → [`OutputSchema`]. New kinds are
//!   registered data, not code paths.
//! - **[`Backend`]**: provider abstraction with OpenAI-compatible, Ollama
//!   and scripted mock implementations.
//! - **[`RunSink`]** / **[`ProgressSink`]**: persistence and progress
//!   collaborators supplied by the caller.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tet_workflow::{ExecutionContext, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::from_file("tet.json")?;
//!     let pipeline = config.build()?;
//!
//!     let inputs = ExecutionContext::new()
//!         .with("original_poem", "床前明月光，疑是地上霜。")
//!         .with("source_lang", "Chinese")
//!         .with("target_lang", "English");
//!
//!     let run = pipeline.run(inputs).await;
//!     println!("{:?}", run.status);
//!     if let Some(text) = run.output("revise.revised_translation") {
//!         println!("{}", text);
//!     }
//!     println!("tokens: {}, cost: {}", run.total_tokens(), run.total_cost());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod output_parser;
pub mod persistence;
pub mod pipeline;
pub mod result;
pub mod retry;
pub mod selection;
pub mod step;
pub mod template;

pub use backend::{
    Backend, BackoffConfig, LlmRequest, LlmResponse, MockBackend, MockReply, OllamaBackend,
    OpenAiBackend, Pricing, ProviderRegistry,
};
pub use config::{PipelineConfig, ProviderConfig, ProviderKind};
pub use context::ExecutionContext;
pub use error::{ErrorKind, PipelineError, Result};
pub use events::{CollectingSink, FnProgressSink, ProgressEvent, ProgressKind, ProgressSink};
pub use executor::StepExecutor;
pub use output_parser::{OutputSchema, ParseError, ParseStrategy, ParserRegistry};
pub use persistence::{JsonFileSink, MemorySink, NullSink, RunSink};
pub use pipeline::{Pipeline, PipelineBuilder, RunState};
pub use result::{
    ParallelCandidateSet, PipelineRunResult, RunStatus, RunWarning, SelectionRecord, StepResult,
    Usage,
};
pub use retry::RetryPolicy;
pub use selection::{select_best, Selection, SelectionFailure};
pub use step::{GenerationParams, ParamOverride, ParallelSpec, StepRole, StepSpec};
