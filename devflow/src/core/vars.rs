//! Variable environment with dotted-path lookup and `{{placeholder}}` substitution.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FlowError;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*(?:\|([^}]*))?\}\}").expect("placeholder regex")
});

/// Mutable variable bindings owned by a single workflow instance.
///
/// Values are JSON so nested maps can be addressed with dotted paths
/// (`user.name`). Keys are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableEnvironment {
    vars: BTreeMap<String, Value>,
}

impl VariableEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Top-level variable names, sorted.
    fn names(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }

    /// Resolve a dotted path. Returns `None` as soon as a segment is missing or null.
    ///
    /// A top-level key that itself contains dots (e.g. set as `"a.b"`) is
    /// preferred over nested traversal.
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.vars.get(path) {
            return (!value.is_null()).then_some(value);
        }
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.vars.get(first)?;
        for segment in segments {
            if current.is_null() {
                return None;
            }
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        (!current.is_null()).then_some(current)
    }

    pub fn resolve_with_default(&self, path: &str, default: Value) -> Value {
        self.resolve(path).cloned().unwrap_or(default)
    }

    /// True when the path resolves to a value (null counts as unbound).
    pub fn is_defined(&self, path: &str) -> bool {
        self.resolve(path).is_some()
    }

    /// Replace every `{{path}}` / `{{path|default}}` in `text`.
    ///
    /// A placeholder without a default whose path does not resolve fails with
    /// [`FlowError::UndefinedVariable`].
    pub fn substitute(&self, text: &str) -> Result<String, FlowError> {
        let mut missing: Option<String> = None;
        let replaced = PLACEHOLDER_RE.replace_all(text, |caps: &Captures<'_>| {
            let path = &caps[1];
            match (self.resolve(path), caps.get(2)) {
                (Some(value), _) => stringify(value),
                (None, Some(default)) => default.as_str().to_string(),
                (None, None) => {
                    missing.get_or_insert_with(|| path.to_string());
                    String::new()
                }
            }
        });
        match missing {
            Some(name) => Err(FlowError::UndefinedVariable {
                name,
                known: self.names(),
            }),
            None => Ok(replaced.into_owned()),
        }
    }

    /// Child environment: this snapshot overridden by `overrides`.
    pub fn merged_with(&self, overrides: &BTreeMap<String, String>) -> Self {
        let mut vars = self.vars.clone();
        for (key, value) in overrides {
            vars.insert(key.clone(), Value::String(value.clone()));
        }
        Self { vars }
    }
}

/// Render a value the way it appears in substituted text.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
