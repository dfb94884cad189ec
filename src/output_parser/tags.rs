//! Structural scanning of XML-style tagged sections.
//!
//! LLM answers in this workflow are plain prose wrapped in named sections:
//!
//! ```text
//! <initial_translation>
//! 床前明月光
//! </initial_translation>
//! <initial_translation_notes>...</initial_translation_notes>
//! ```
//!
//! [`scan_sections`] is the strict strategy: a single pass over the text with
//! an explicit state machine (`Outside → TagName → Content → ClosingTag`).
//! It understands attributes in any order, quoted `>` inside attribute values,
//! self-closing tags and nested tags of the same name. It is *not* a full XML
//! parser: entities are left alone and stray `<` characters in poems are
//! treated as text.
//!
//! [`scan_sections_lenient`] is the best-effort fallback used when the strict
//! pass fails.

use std::collections::BTreeMap;

use crate::output_parser::error::ParseError;

/// One markup tag found in the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Tag<'a> {
    /// Tag name as written.
    pub name: &'a str,
    /// `</name>`
    pub closing: bool,
    /// `<name/>` or `<name attr="x" />`
    pub self_closing: bool,
    /// Byte offset of the `<`.
    pub start: usize,
    /// Byte offset just past the `>`.
    pub end: usize,
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

/// Try to read a tag starting at byte `start` (which must point at `<`).
///
/// Returns `None` when the text at `start` is not tag syntax, e.g. `a < b`.
/// With `lenient`, whitespace is allowed after `<` and `</`.
pub(crate) fn read_tag(text: &str, start: usize, lenient: bool) -> Option<Tag<'_>> {
    let bytes = text.as_bytes();
    debug_assert_eq!(bytes.get(start), Some(&b'<'));
    let mut i = start + 1;

    let skip_ws = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        i
    };

    if lenient {
        i = skip_ws(i);
    }
    let closing = bytes.get(i) == Some(&b'/');
    if closing {
        i += 1;
        if lenient {
            i = skip_ws(i);
        }
    }

    // tag name
    let name_start = i;
    let first = text[i..].chars().next()?;
    if !is_name_start(first) {
        return None;
    }
    i += first.len_utf8();
    while let Some(c) = text[i..].chars().next() {
        if !is_name_char(c) {
            break;
        }
        i += c.len_utf8();
    }
    let name = &text[name_start..i];

    // attributes, up to `>` or `/>`
    let mut quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' if !closing => quote = Some(b),
                b'>' => {
                    return Some(Tag {
                        name,
                        closing,
                        self_closing: false,
                        start,
                        end: i + 1,
                    })
                }
                b'/' if bytes.get(i + 1) == Some(&b'>') && !closing => {
                    return Some(Tag {
                        name,
                        closing,
                        self_closing: true,
                        start,
                        end: i + 2,
                    })
                }
                b'<' => return None,
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Iterate over every syntactically valid tag in `text`, in order.
pub(crate) fn tags(text: &str, lenient: bool) -> Vec<Tag<'_>> {
    let mut found = Vec::new();
    let mut from = 0;
    while let Some(offset) = text[from..].find('<') {
        let start = from + offset;
        match read_tag(text, start, lenient) {
            Some(tag) => {
                from = tag.end;
                found.push(tag);
            }
            None => from = start + 1,
        }
    }
    found
}

/// Scanner state for the strict pass.
enum State<'a> {
    /// Between sections, looking for an expected opening tag.
    Outside,
    /// Inside an expected section; `depth` counts nested same-name tags.
    Content {
        name: &'a str,
        content_start: usize,
        depth: usize,
    },
}

/// Strictly extract the sections named in `expected`.
///
/// Returns a map of the sections found (first occurrence wins), each with
/// its inner text verbatim apart from outer-boundary whitespace. Sections
/// absent from the text are absent from the map. Fails only when an expected
/// section is opened but never closed.
///
/// # Examples
///
/// ```
/// use tet_workflow::output_parser::scan_sections;
///
/// let text = "Here you go:\n<title lang=\"zh\">静夜思</title>\n<body>\n床前明月光\n疑是地上霜\n</body>";
/// let sections = scan_sections(text, &["title", "body"]).unwrap();
/// assert_eq!(sections["title"], "静夜思");
/// assert_eq!(sections["body"], "床前明月光\n疑是地上霜");
/// ```
pub fn scan_sections(
    text: &str,
    expected: &[&str],
) -> Result<BTreeMap<String, String>, ParseError> {
    let mut found = BTreeMap::new();
    let mut state = State::Outside;

    for tag in tags(text, false) {
        state = match state {
            State::Outside => {
                if tag.closing || !expected.contains(&tag.name) {
                    State::Outside
                } else if tag.self_closing {
                    found
                        .entry(tag.name.to_string())
                        .or_insert_with(String::new);
                    State::Outside
                } else {
                    State::Content {
                        name: tag.name,
                        content_start: tag.end,
                        depth: 1,
                    }
                }
            }
            State::Content {
                name,
                content_start,
                depth,
            } => {
                if tag.name != name || tag.self_closing {
                    State::Content {
                        name,
                        content_start,
                        depth,
                    }
                } else if !tag.closing {
                    State::Content {
                        name,
                        content_start,
                        depth: depth + 1,
                    }
                } else if depth > 1 {
                    State::Content {
                        name,
                        content_start,
                        depth: depth - 1,
                    }
                } else {
                    let content = text[content_start..tag.start].trim();
                    found
                        .entry(name.to_string())
                        .or_insert_with(|| content.to_string());
                    State::Outside
                }
            }
        };
    }

    match state {
        State::Outside => Ok(found),
        State::Content { name, .. } => Err(ParseError::Unclosed {
            tag: name.to_string(),
        }),
    }
}

/// Best-effort section extraction for slightly malformed output.
///
/// For each expected name, the first opening tag (case-insensitive, spaces
/// tolerated inside the brackets) starts the section. It ends at the next
/// matching closing tag, or failing that at the next opening tag of another
/// expected section, or at the end of the text. Never fails; sections that
/// cannot be located are simply absent.
///
/// # Examples
///
/// ```
/// use tet_workflow::output_parser::scan_sections_lenient;
///
/// // `</a>` is missing
/// let sections = scan_sections_lenient("<a>one\n<b>two</b>", &["a", "b"]);
/// assert_eq!(sections["a"], "one");
/// assert_eq!(sections["b"], "two");
/// ```
pub fn scan_sections_lenient(text: &str, expected: &[&str]) -> BTreeMap<String, String> {
    let all = tags(text, true);
    let lowered: Vec<String> = expected.iter().map(|e| e.to_ascii_lowercase()).collect();
    let is_expected = |name: &str| lowered.iter().any(|e| e.eq_ignore_ascii_case(name));

    let mut found = BTreeMap::new();
    for (want, original) in lowered.iter().zip(expected) {
        let Some(open_idx) = all
            .iter()
            .position(|t| !t.closing && t.name.eq_ignore_ascii_case(want))
        else {
            continue;
        };
        let open = &all[open_idx];
        if open.self_closing {
            found.insert(original.to_string(), String::new());
            continue;
        }

        let rest = &all[open_idx + 1..];
        let end = rest
            .iter()
            .find(|t| t.closing && t.name.eq_ignore_ascii_case(want))
            .or_else(|| {
                rest.iter().find(|t| {
                    !t.closing && !t.name.eq_ignore_ascii_case(want) && is_expected(t.name)
                })
            })
            .map(|t| t.start)
            .unwrap_or(text.len());

        let content = text[open.end..end].trim();
        found.insert(original.to_string(), content.to_string());
    }
    found
}
