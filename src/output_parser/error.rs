//! Error types for LLM output parsers.

/// Errors returned by output parsers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The LLM response was empty or whitespace-only.
    #[error("empty LLM response")]
    EmptyResponse,

    /// A tag was opened but never closed, so strict scanning gave up.
    #[error("unclosed <{tag}> section")]
    Unclosed {
        /// Name of the tag that was left open.
        tag: String,
    },

    /// Neither the strict scan nor the fallback found the required sections.
    #[error("missing required sections: {}", fields.join(", "))]
    MissingFields {
        /// Required field names that were absent or empty.
        fields: Vec<String>,
    },

    /// The step kind has no registered schema.
    #[error("no output schema registered for step kind '{0}'")]
    UnknownKind(String),

    /// No candidate index could be read from a judgment.
    #[error("no valid candidate index found in response")]
    NoIndex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_lists_names() {
        let err = ParseError::MissingFields {
            fields: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "missing required sections: a, b");
    }
}
