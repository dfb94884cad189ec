//! Variable bindings threaded through a workflow run.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The accumulated `name → value` bindings available to prompt templates.
///
/// A run starts from the caller's inputs (`original_poem`, `source_lang`,
/// ...) and grows as steps complete: each step's fields are merged under
/// `"{namespace}.{field}"`. The orchestrator owns one context per run and
/// hands each parallel branch its own clone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    data: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Insert a binding, returning the previous value if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.data.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(|s| s.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge a step's structured output.
    ///
    /// Each field lands under `context_key(namespace, field)` unless `aliases`
    /// maps it to an explicit key.
    pub fn merge_fields(
        &mut self,
        namespace: &str,
        aliases: &BTreeMap<String, String>,
        fields: &BTreeMap<String, String>,
    ) {
        for (field, value) in fields {
            let key = aliases
                .get(field)
                .cloned()
                .unwrap_or_else(|| context_key(namespace, field));
            self.data.insert(key, value.clone());
        }
    }
}

/// Context key a step field is published under.
///
/// ```
/// use tet_workflow::context::context_key;
///
/// assert_eq!(context_key("initial", "initial_translation"), "initial.initial_translation");
/// assert_eq!(context_key("", "notes"), "notes");
/// ```
pub fn context_key(namespace: &str, field: &str) -> String {
    if namespace.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", namespace, field)
    }
}

impl From<HashMap<String, String>> for ExecutionContext {
    fn from(map: HashMap<String, String>) -> Self {
        Self {
            data: map.into_iter().collect(),
        }
    }
}

impl From<BTreeMap<String, String>> for ExecutionContext {
    fn from(data: BTreeMap<String, String>) -> Self {
        Self { data }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ExecutionContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
