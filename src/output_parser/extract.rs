//! Shared preprocessing for LLM output parsing.
//!
//! Every schema parser calls [`preprocess`] first. Reasoning models
//! (DeepSeek-R1 and friends) wrap their chain of thought in `<think>` blocks;
//! those are separated from the answer here so the tag scanner never sees them.

/// Full preprocessing pipeline applied to every LLM response.
///
/// Strips `<think>` and `<thinking>` blocks, then trims whitespace.
pub fn preprocess(text: &str) -> String {
    let stripped = strip_think_tags(text);
    stripped.trim().to_string()
}

/// Split a response into `(thinking, answer)`.
///
/// Collects the content of every complete `<think>`/`<thinking>` block. The
/// answer is the text with those blocks removed and trimmed.
///
/// # Examples
///
/// ```
/// use tet_workflow::output_parser::extract_thinking;
///
/// let (thinking, answer) = extract_thinking("<think>rhyme?</think><a>x</a>");
/// assert_eq!(thinking.as_deref(), Some("rhyme?"));
/// assert_eq!(answer, "<a>x</a>");
/// ```
pub fn extract_thinking(text: &str) -> (Option<String>, String) {
    let mut thoughts = Vec::new();
    for (open, close) in [("<think>", "</think>"), ("<thinking>", "</thinking>")] {
        let mut from = 0;
        while let Some(start) = text[from..].find(open) {
            let content_start = from + start + open.len();
            match text[content_start..].find(close) {
                Some(end) => {
                    let thought = text[content_start..content_start + end].trim();
                    if !thought.is_empty() {
                        thoughts.push(thought.to_string());
                    }
                    from = content_start + end + close.len();
                }
                None => break,
            }
        }
    }
    let thinking = if thoughts.is_empty() {
        None
    } else {
        Some(thoughts.join("\n\n"))
    };
    (thinking, preprocess(text))
}

/// Strip all `<think>...</think>` and `<thinking>...</thinking>` blocks from text.
///
/// Handles complete blocks, incomplete blocks (no closing tag),
/// and multiple sequential blocks.
///
/// # Examples
///
/// ```
/// use tet_workflow::output_parser::strip_think_tags;
///
/// assert_eq!(strip_think_tags("<think>reasoning</think>result"), "result");
/// assert_eq!(strip_think_tags("<think>no closing tag"), "");
/// assert_eq!(strip_think_tags("<thinking>also works</thinking>done"), "done");
/// ```
pub fn strip_think_tags(text: &str) -> String {
    let mut result = strip_tag_variant(text, "<think>", "</think>");
    result = strip_tag_variant(&result, "<thinking>", "</thinking>");
    result
}

/// Strip a specific open/close tag pair from text.
fn strip_tag_variant(text: &str, open: &str, close: &str) -> String {
    let mut result = text.to_string();
    while let Some(start) = result.find(open) {
        if let Some(end_offset) = result[start..].find(close) {
            let end = start + end_offset + close.len();
            result = format!("{}{}", &result[..start], &result[end..]);
        } else {
            // No closing tag: the model ran out of budget mid-thought
            result = result[..start].to_string();
            break;
        }
    }
    result
}
