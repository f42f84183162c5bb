//! Result placeholders in task input
//!
//! A string in a task's input may reference a dependency's result with
//! `{{<task_id>.result}}` or a nested field with `{{<task_id>.result.<path>}}`.
//! A string that is exactly one placeholder is replaced by the referenced JSON
//! value. Placeholders embedded in longer text are replaced by their textual
//! rendering. References to tasks that are not declared dependencies are left
//! untouched.

use crate::agent::AgentResult;
use crate::{Error, Result};
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::HashMap;

const RESULT_PLACEHOLDER: &str =
    r"\{\{\s*([A-Za-z0-9_\-]+)\.result((?:\.[A-Za-z0-9_\-]+)*)\s*\}\}";

/// Resolves `{{task.result}}` references against finished tasks
#[derive(Debug, Clone)]
pub struct PlaceholderResolver {
    pattern: Regex,
}

impl PlaceholderResolver {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(RESULT_PLACEHOLDER).map_err(|e| {
            Error::Internal(format!("Invalid result placeholder pattern: {}", e))
        })?;
        Ok(Self { pattern })
    }

    /// Replace placeholders throughout `value`
    pub fn resolve(
        &self,
        value: &Value,
        dependencies: &[String],
        results: &HashMap<String, AgentResult>,
    ) -> Value {
        match value {
            Value::String(s) => self.resolve_str(s, dependencies, results),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve(item, dependencies, results))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve(v, dependencies, results)))
                    .collect::<Map<String, Value>>(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_str(
        &self,
        s: &str,
        dependencies: &[String],
        results: &HashMap<String, AgentResult>,
    ) -> Value {
        if let Some(captures) = self.pattern.captures(s) {
            let whole = captures.get(0).is_some_and(|m| m.as_str() == s);
            if whole {
                return lookup(&captures, dependencies, results)
                    .unwrap_or_else(|| Value::String(s.to_string()));
            }
        } else {
            return Value::String(s.to_string());
        }

        let replaced = self.pattern.replace_all(s, |captures: &Captures| {
            match lookup(captures, dependencies, results) {
                None => captures[0].to_string(),
                Some(Value::Null) => String::new(),
                Some(Value::String(text)) => text,
                Some(other) => other.to_string(),
            }
        });
        Value::String(replaced.into_owned())
    }
}

/// Value a placeholder refers to; `None` when the root is not a dependency
fn lookup(
    captures: &Captures,
    dependencies: &[String],
    results: &HashMap<String, AgentResult>,
) -> Option<Value> {
    let root = &captures[1];
    if !dependencies.iter().any(|d| d == root) {
        return None;
    }

    let Some(content) = results.get(root).and_then(AgentResult::successful_content) else {
        return Some(Value::Null);
    };

    let path = captures.get(2).map_or("", |m| m.as_str());
    let mut current = content;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Some(Value::Null),
        }
    }
    Some(current.clone())
}
