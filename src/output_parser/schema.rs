//! Schema-driven parser selection.
//!
//! Each step kind maps to an [`OutputSchema`]: the sections it must produce,
//! the sections it may produce, and the function that turns raw model text
//! into a [`ParsedOutput`]. The [`ParserRegistry`] is a lookup table, so a new
//! step kind is a data insertion rather than another branch in the executor.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::output_parser::error::ParseError;
use crate::output_parser::extract::extract_thinking;
use crate::output_parser::tags::{scan_sections, scan_sections_lenient};

/// Built-in step kind: first-pass translation.
pub const INITIAL_TRANSLATION: &str = "initial_translation";
/// Built-in step kind: editor critique of a translation.
pub const EDITOR_REVIEW: &str = "editor_review";
/// Built-in step kind: translator revision after review.
pub const TRANSLATOR_REVISION: &str = "translator_revision";
/// Built-in step kind: judgment over parallel candidates.
pub const EVALUATION: &str = "evaluation";

/// Field of the [`EVALUATION`] schema holding the preferred candidate number.
pub const BEST_CANDIDATE_FIELD: &str = "best_candidate";

/// Type alias for a schema parse function.
pub type SchemaParseFn =
    Arc<dyn Fn(&str, &OutputSchema) -> Result<ParsedOutput, ParseError> + Send + Sync>;

/// Which strategy produced a [`ParsedOutput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStrategy {
    /// The structural scanner found every required section.
    Strict,
    /// The best-effort scan filled in what the strict pass could not.
    Fallback,
    /// A caller-supplied parse function.
    Custom,
}

/// The structured record extracted from one LLM response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput {
    /// Section name → content.
    pub fields: BTreeMap<String, String>,
    /// Reasoning text from `<think>` blocks, if any.
    pub thinking: Option<String>,
    pub strategy: ParseStrategy,
}

/// Output contract for one step kind.
#[derive(Clone)]
pub struct OutputSchema {
    /// Step kind this schema is registered under.
    pub kind: String,
    /// Sections that must be present and non-empty.
    pub required: Vec<String>,
    /// Sections that are extracted when present.
    pub optional: Vec<String>,
    parse_fn: SchemaParseFn,
}

impl OutputSchema {
    /// A schema using the default tagged-section parser.
    pub fn tagged(kind: impl Into<String>, required: &[&str], optional: &[&str]) -> Self {
        Self {
            kind: kind.into(),
            required: required.iter().map(|s| s.to_string()).collect(),
            optional: optional.iter().map(|s| s.to_string()).collect(),
            parse_fn: Arc::new(parse_tagged),
        }
    }

    /// Replace the parse function.
    pub fn with_parser(
        mut self,
        f: impl Fn(&str, &OutputSchema) -> Result<ParsedOutput, ParseError> + Send + Sync + 'static,
    ) -> Self {
        self.parse_fn = Arc::new(f);
        self
    }

    /// Every field this schema can produce, required first.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .map(String::as_str)
    }

    /// Parse raw model text against this schema.
    pub fn parse(&self, raw: &str) -> Result<ParsedOutput, ParseError> {
        (self.parse_fn)(raw, self)
    }

    /// Required fields absent or empty in `fields`.
    pub fn missing_required(&self, fields: &BTreeMap<String, String>) -> Vec<String> {
        self.required
            .iter()
            .filter(|name| fields.get(*name).map_or(true, |v| v.trim().is_empty()))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for OutputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSchema")
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("optional", &self.optional)
            .finish()
    }
}

/// Default parse function: strict structural scan, then best-effort fallback.
///
/// # Examples
///
/// ```
/// use tet_workflow::output_parser::{parse_tagged, OutputSchema, ParseStrategy};
///
/// let schema = OutputSchema::tagged("demo", &["title"], &["notes"]);
/// let parsed = parse_tagged("<title>Moon</title>", &schema).unwrap();
/// assert_eq!(parsed.fields["title"], "Moon");
/// assert_eq!(parsed.strategy, ParseStrategy::Strict);
/// ```
pub fn parse_tagged(raw: &str, schema: &OutputSchema) -> Result<ParsedOutput, ParseError> {
    let (thinking, cleaned) = extract_thinking(raw);
    if cleaned.is_empty() {
        return Err(ParseError::EmptyResponse);
    }

    let expected: Vec<&str> = schema.fields().collect();

    if let Ok(fields) = scan_sections(&cleaned, &expected) {
        if schema.missing_required(&fields).is_empty() {
            return Ok(ParsedOutput {
                fields,
                thinking,
                strategy: ParseStrategy::Strict,
            });
        }
    }

    // Best effort: keep anything the strict pass extracted cleanly.
    let mut fields = scan_sections(&cleaned, &expected).unwrap_or_default();
    for (name, content) in scan_sections_lenient(&cleaned, &expected) {
        let entry = fields.entry(name).or_default();
        if entry.trim().is_empty() {
            *entry = content;
        }
    }

    let missing = schema.missing_required(&fields);
    if !missing.is_empty() {
        return Err(ParseError::MissingFields { fields: missing });
    }

    Ok(ParsedOutput {
        fields,
        thinking,
        strategy: ParseStrategy::Fallback,
    })
}

/// Lookup table from step kind to [`OutputSchema`].
#[derive(Debug, Clone, Default)]
pub struct ParserRegistry {
    schemas: HashMap<String, OutputSchema>,
}

impl ParserRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the four T-E-T step kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(OutputSchema::tagged(
            INITIAL_TRANSLATION,
            &["initial_translation", "initial_translation_notes"],
            &["translated_poem_title", "translated_poet_name"],
        ));
        registry.register(OutputSchema::tagged(
            EDITOR_REVIEW,
            &["editor_suggestions"],
            &["overall_assessment"],
        ));
        registry.register(OutputSchema::tagged(
            TRANSLATOR_REVISION,
            &["revised_translation", "revised_translation_notes"],
            &["refined_translated_poem_title", "refined_translated_poet_name"],
        ));
        // The judge may answer in prose; an unreadable verdict is handled by selection.
        registry.register(OutputSchema::tagged(
            EVALUATION,
            &[],
            &[BEST_CANDIDATE_FIELD, "critique"],
        ));
        registry
    }

    /// Register (or replace) a schema under its kind.
    pub fn register(&mut self, schema: OutputSchema) -> &mut Self {
        self.schemas.insert(schema.kind.clone(), schema);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, schema: OutputSchema) -> Self {
        self.register(schema);
        self
    }

    pub fn get(&self, kind: &str) -> Option<&OutputSchema> {
        self.schemas.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.schemas.contains_key(kind)
    }

    /// Parse `raw` with the schema registered for `kind`.
    pub fn parse(&self, kind: &str, raw: &str) -> Result<ParsedOutput, ParseError> {
        self.get(kind)
            .ok_or_else(|| ParseError::UnknownKind(kind.to_string()))?
            .parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(fields: &[(&str, &str)]) -> String {
        fields
            .iter()
            .map(|(k, v)| format!("<{k}>\n{v}\n</{k}>"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_every_builtin_recovers_its_fields() {
        let registry = ParserRegistry::with_builtins();
        for kind in [INITIAL_TRANSLATION, EDITOR_REVIEW, TRANSLATOR_REVISION, EVALUATION] {
            let schema = registry.get(kind).unwrap();
            let values: Vec<(String, String)> = schema
                .fields()
                .map(|f| (f.to_string(), format!("{f}: line one,\nline \"two\"; end.")))
                .collect();
            let pairs: Vec<(&str, &str)> =
                values.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

            let parsed = registry.parse(kind, &tagged(&pairs)).unwrap();
            assert_eq!(parsed.strategy, ParseStrategy::Strict, "kind {kind}");
            for (k, v) in &values {
                assert_eq!(&parsed.fields[k], v, "kind {kind} field {k}");
            }
        }
    }

    #[test]
    fn test_fallback_on_missing_close_tag() {
        let registry = ParserRegistry::with_builtins();
        let raw = "<initial_translation>\nMoonlight before my bed\n\
                   <initial_translation_notes>Kept the imagery.</initial_translation_notes>\n\
                   <translated_poem_title>Quiet Night</translated_poem_title>";
        let parsed = registry.parse(INITIAL_TRANSLATION, raw).unwrap();
        assert_eq!(parsed.strategy, ParseStrategy::Fallback);
        assert_eq!(parsed.fields["initial_translation"], "Moonlight before my bed");
        assert_eq!(parsed.fields["initial_translation_notes"], "Kept the imagery.");
        assert_eq!(parsed.fields["translated_poem_title"], "Quiet Night");
    }

    #[test]
    fn test_missing_required_field_is_named() {
        let registry = ParserRegistry::with_builtins();
        let raw = "<initial_translation>text</initial_translation>";
        let err = registry.parse(INITIAL_TRANSLATION, raw).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingFields {
                fields: vec!["initial_translation_notes".into()]
            }
        );
    }

    #[test]
    fn test_empty_required_field_counts_as_missing() {
        let registry = ParserRegistry::with_builtins();
        let raw = "<editor_suggestions>   </editor_suggestions>";
        let err = registry.parse(EDITOR_REVIEW, raw).unwrap_err();
        assert!(matches!(err, ParseError::MissingFields { .. }));
    }

    #[test]
    fn test_thinking_is_separated() {
        let registry = ParserRegistry::with_builtins();
        let raw = "<think>The <editor_suggestions> tag goes here</think>\
                   <editor_suggestions>1. Tighten line two.</editor_suggestions>";
        let parsed = registry.parse(EDITOR_REVIEW, raw).unwrap();
        assert_eq!(parsed.fields["editor_suggestions"], "1. Tighten line two.");
        assert!(parsed.thinking.unwrap().contains("tag goes here"));
    }

    #[test]
    fn test_unknown_kind() {
        let registry = ParserRegistry::with_builtins();
        let err = registry.parse("haiku", "<a>b</a>").unwrap_err();
        assert_eq!(err, ParseError::UnknownKind("haiku".into()));
    }

    #[test]
    fn test_registering_a_new_kind() {
        let registry = ParserRegistry::with_builtins()
            .with(OutputSchema::tagged("glossary", &["terms"], &[]));
        let parsed = registry.parse("glossary", "<terms>moon: 月</terms>").unwrap();
        assert_eq!(parsed.fields["terms"], "moon: 月");
    }

    #[test]
    fn test_custom_parser() {
        let schema = OutputSchema::tagged("upper", &["text"], &[]).with_parser(|raw, _| {
            let mut fields = BTreeMap::new();
            fields.insert("text".to_string(), raw.to_uppercase());
            Ok(ParsedOutput {
                fields,
                thinking: None,
                strategy: ParseStrategy::Custom,
            })
        });
        let parsed = schema.parse("moon").unwrap();
        assert_eq!(parsed.fields["text"], "MOON");
    }

    #[test]
    fn test_empty_response() {
        let registry = ParserRegistry::with_builtins();
        let err = registry.parse(EDITOR_REVIEW, "<think>only thoughts</think>").unwrap_err();
        assert_eq!(err, ParseError::EmptyResponse);
    }
}
