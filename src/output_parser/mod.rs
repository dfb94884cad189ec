//! # LLM Output Parser
//!
//! Turns raw model text into the structured records the workflow threads
//! from step to step. Responses are expected to wrap each field in a named
//! section (`<initial_translation>...</initial_translation>`); the parser
//! extracts them structurally and falls back to a tolerant scan when the
//! model's formatting slips.
//!
//! ## Entry points
//!
//! | Item | Use Case |
//! |------|----------|
//! | [`ParserRegistry`] | Step kind → [`OutputSchema`] lookup used by the executor |
//! | [`parse_tagged`] | Default schema parser (strict, then fallback) |
//! | [`scan_sections`] | Strict single-pass tag scanner |
//! | [`scan_sections_lenient`] | Best-effort scanner for malformed output |
//! | [`parse_candidate_index`] | Read a judge's preferred candidate |
//!
//! ## Shared Utilities
//!
//! | Function | Purpose |
//! |----------|---------|
//! | [`strip_think_tags`] | Remove `<think>` blocks from text |
//! | [`extract_thinking`] | Split reasoning from the answer |

pub mod error;
pub mod extract;
pub mod index;
pub mod schema;
pub mod tags;

pub use error::ParseError;
pub use extract::{extract_thinking, preprocess, strip_think_tags};
pub use index::parse_candidate_index;
pub use schema::{
    parse_tagged, OutputSchema, ParseStrategy, ParsedOutput, ParserRegistry, SchemaParseFn,
    BEST_CANDIDATE_FIELD, EDITOR_REVIEW, EVALUATION, INITIAL_TRANSLATION, TRANSLATOR_REVISION,
};
pub use tags::{scan_sections, scan_sections_lenient};
