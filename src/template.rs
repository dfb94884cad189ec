//! Prompt template rendering.
//!
//! Templates are plain text with `{name}` placeholders resolved from the
//! [`ExecutionContext`]. `{name?}` marks an optional placeholder that renders
//! as an empty string when the binding is absent (used for fields produced by
//! optional steps). Use `{{` to insert a literal `{` and `}}` to insert a
//! literal `}`. A `{` that does not start a well-formed placeholder is kept
//! as text.

use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};

/// A placeholder referenced by a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub name: String,
    /// Written as `{name?}`.
    pub optional: bool,
}

enum Segment<'a> {
    Text(&'a str),
    Var { name: &'a str, optional: bool },
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Split a template into literal text and placeholders.
fn segments(template: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut text_start = 0;
    let mut i = 0;
    let bytes = template.as_bytes();

    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                out.push(Segment::Text(&template[text_start..i + 1]));
                i += 2;
                text_start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                out.push(Segment::Text(&template[text_start..i + 1]));
                i += 2;
                text_start = i;
            }
            b'{' => {
                let Some(close) = template[i + 1..].find('}') else {
                    i += 1;
                    continue;
                };
                let inner = &template[i + 1..i + 1 + close];
                let (name, optional) = match inner.strip_suffix('?') {
                    Some(n) => (n, true),
                    None => (inner, false),
                };
                if name.is_empty() || !name.chars().all(is_name_char) {
                    i += 1;
                    continue;
                }
                out.push(Segment::Text(&template[text_start..i]));
                out.push(Segment::Var { name, optional });
                i += close + 2;
                text_start = i;
            }
            _ => i += 1,
        }
    }
    out.push(Segment::Text(&template[text_start..]));
    out
}

/// Every placeholder referenced by `template`, in order of appearance.
///
/// # Example
///
/// ```
/// use tet_workflow::template::placeholders;
///
/// let found = placeholders("Translate {original_poem} into {target_lang}. {notes?}");
/// let names: Vec<_> = found.iter().map(|p| p.name.as_str()).collect();
/// assert_eq!(names, ["original_poem", "target_lang", "notes"]);
/// assert!(found[2].optional);
/// ```
pub fn placeholders(template: &str) -> Vec<Placeholder> {
    segments(template)
        .into_iter()
        .filter_map(|s| match s {
            Segment::Var { name, optional } => Some(Placeholder {
                name: name.to_string(),
                optional,
            }),
            Segment::Text(_) => None,
        })
        .collect()
}

/// Render `template` against `context`.
///
/// A required placeholder without a binding is a configuration bug and fails
/// with [`PipelineError::MissingPlaceholder`] naming `step`.
///
/// # Example
///
/// ```
/// use tet_workflow::context::ExecutionContext;
/// use tet_workflow::template::render;
///
/// let ctx = ExecutionContext::new().with("name", "Li Bai");
/// let result = render("Poet: {name}. Format: {{\"k\": 1}} {missing?}", "demo", &ctx).unwrap();
/// assert_eq!(result, r#"Poet: Li Bai. Format: {"k": 1} "#);
/// ```
pub fn render(template: &str, step: &str, context: &ExecutionContext) -> Result<String> {
    let mut rendered = String::with_capacity(template.len());
    for segment in segments(template) {
        match segment {
            Segment::Text(t) => rendered.push_str(t),
            Segment::Var { name, optional } => match context.get(name) {
                Some(value) => rendered.push_str(value),
                None if optional => {}
                None => {
                    return Err(PipelineError::MissingPlaceholder {
                        step: step.to_string(),
                        placeholder: name.to_string(),
                    })
                }
            },
        }
    }
    Ok(rendered)
}

/// Wrap content in a named section, the format the parsers read back.
pub fn tagged_section(tag: &str, content: &str) -> String {
    format!("<{tag}>\n{content}\n</{tag}>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_basic() {
        let ctx = ExecutionContext::new()
            .with("source_lang", "English")
            .with("target_lang", "Chinese");
        let result = render("From {source_lang} to {target_lang}", "s", &ctx).unwrap();
        assert_eq!(result, "From English to Chinese");
    }

    #[test]
    fn test_render_no_placeholders() {
        let result = render("static prompt", "s", &ExecutionContext::new()).unwrap();
        assert_eq!(result, "static prompt");
    }

    #[test]
    fn test_render_missing_required_fails() {
        let err = render("Poem: {original_poem}", "initial", &ExecutionContext::new()).unwrap_err();
        match err {
            PipelineError::MissingPlaceholder { step, placeholder } => {
                assert_eq!(step, "initial");
                assert_eq!(placeholder, "original_poem");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_render_optional_absent_is_empty() {
        let ctx = ExecutionContext::new();
        let result = render("[{review.overall_assessment?}]", "s", &ctx).unwrap();
        assert_eq!(result, "[]");
    }

    #[test]
    fn test_render_value_not_rescanned() {
        let ctx = ExecutionContext::new().with("a", "{b}").with("b", "nope");
        assert_eq!(render("{a}", "s", &ctx).unwrap(), "{b}");
    }

    #[test]
    fn test_render_escaped_braces() {
        let ctx = ExecutionContext::new().with("name", "Alice");
        let result = render("Hello {name}, JSON: {{\"key\": \"val\"}}", "s", &ctx).unwrap();
        assert_eq!(result, r#"Hello Alice, JSON: {"key": "val"}"#);
    }

    #[test]
    fn test_stray_braces_are_text() {
        let ctx = ExecutionContext::new();
        assert_eq!(render("a { b } c", "s", &ctx).unwrap(), "a { b } c");
        assert_eq!(render("open { only", "s", &ctx).unwrap(), "open { only");
    }

    #[test]
    fn test_placeholders_dotted() {
        let found = placeholders("{initial.initial_translation} and {{literal}}");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "initial.initial_translation");
        assert!(!found[0].optional);
    }

    #[test]
    fn test_tagged_section() {
        assert_eq!(tagged_section("a", "x"), "<a>\nx\n</a>");
    }
}
