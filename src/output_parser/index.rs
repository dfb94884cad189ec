//! Candidate-number extraction from judge responses.
//!
//! Judges are shown candidates numbered from 1 and asked to name the best
//! one. Their answers vary: `2`, `Candidate 2`, `**#2**`, or a sentence.
//! [`parse_candidate_index`] reads the number and converts it to a 0-based
//! index, refusing to guess when the answer is ambiguous.

use crate::output_parser::error::ParseError;
use crate::output_parser::extract::preprocess;

/// Words that commonly precede the chosen number.
const LABELS: &[&str] = &["candidate", "translation", "option", "version", "#"];

/// Read a 1-based candidate number from `response` and return it 0-based.
///
/// Strategies, in order:
/// 1. The whole (trimmed, de-formatted) answer is a number
/// 2. A label followed by a number (`Candidate 2`, `#3`), when every
///    labeled number names the same candidate
/// 3. Exactly one distinct in-range number appears anywhere
///
/// Numbers outside `1..=count` never match.
///
/// # Examples
///
/// ```
/// use tet_workflow::output_parser::parse_candidate_index;
///
/// assert_eq!(parse_candidate_index("Candidate 2", 3).unwrap(), 1);
/// assert_eq!(parse_candidate_index("**3**", 3).unwrap(), 2);
/// assert!(parse_candidate_index("they are all lovely", 3).is_err());
/// ```
pub fn parse_candidate_index(response: &str, count: usize) -> Result<usize, ParseError> {
    let cleaned = preprocess(response);
    if cleaned.is_empty() {
        return Err(ParseError::EmptyResponse);
    }
    let in_range = |n: usize| (1..=count).contains(&n);

    // Strategy 1: bare number, possibly bold/quoted/punctuated
    let stripped = cleaned.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if let Ok(n) = stripped.parse::<usize>() {
        if in_range(n) {
            return Ok(n - 1);
        }
    }

    // Strategy 2: labeled numbers; several different ones is no answer
    let lower = cleaned.to_lowercase();
    let mut labeled: Vec<usize> = Vec::new();
    for label in LABELS {
        let mut from = 0;
        while let Some(pos) = lower[from..].find(label) {
            let after = from + pos + label.len();
            let rest = lower[after..].trim_start_matches(|c: char| {
                c.is_whitespace()
                    || matches!(c, '#' | ':' | '*' | '(' | '[' | '-' | 'n' | 'o' | '.')
            });
            if let Some(n) = leading_integer(rest).filter(|n| in_range(*n)) {
                labeled.push(n);
            }
            from = after;
        }
    }
    labeled.sort_unstable();
    labeled.dedup();
    match labeled.as_slice() {
        [] => {}
        [only] => return Ok(only - 1),
        _ => return Err(ParseError::NoIndex),
    }

    // Strategy 3: a single distinct candidate number mentioned
    let mut seen: Vec<usize> = find_all_integers(&cleaned)
        .into_iter()
        .filter(|n| in_range(*n))
        .collect();
    seen.sort_unstable();
    seen.dedup();
    if let [only] = seen.as_slice() {
        return Ok(only - 1);
    }

    Err(ParseError::NoIndex)
}

/// Parse the run of ASCII digits at the start of `text`.
fn leading_integer(text: &str) -> Option<usize> {
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    text[..end].parse().ok()
}

/// Find all unsigned integer substrings in text.
fn find_all_integers(text: &str) -> Vec<usize> {
    let mut numbers = Vec::new();
    let mut current = String::new();
    for c in text.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            if let Ok(n) = current.parse() {
                numbers.push(n);
            }
            current.clear();
        }
    }
    numbers
}
