//! `${...}` placeholder resolution against earlier execution records.
//!
//! Supported references, where `<id>` is a key of the execution context:
//!
//! - `${<id>}` / `${<id>.output}`: the record's raw output text
//! - `${<id>.summary}`, `${<id>.success}`, `${<id>.tool_calls_used}`
//! - `${<id>.output.<path>}` or `${<id>.<path>}`: a value inside the output
//!   parsed as JSON, where `<path>` is dotted with optional `[n]` indexes
//!
//! A string that is exactly one placeholder is replaced by the referenced JSON
//! value; placeholders embedded in longer text are substituted as text.
//! References that cannot be resolved are left untouched so callers can
//! detect them with [`collect_unresolved`].

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;

use crate::core::text::value_text;
use crate::core::types::{ExecutionContext, Params, TodoExecutionRecord};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder regex"));

static PATH_SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\[\]]*)((?:\[\d+\])*)$").expect("path segment regex"));

static INDEX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("index regex"));

/// Resolves placeholders in tool params. Implementations must not modify
/// their inputs.
pub trait ParamResolver: Send + Sync {
    fn resolve(&self, params: &Params, context: &ExecutionContext) -> Params;
}

/// Default resolver implementing the reference syntax above.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateParamResolver;

impl ParamResolver for TemplateParamResolver {
    fn resolve(&self, params: &Params, context: &ExecutionContext) -> Params {
        params
            .iter()
            .map(|(key, value)| (key.clone(), resolve_value(value, context)))
            .collect()
    }
}

/// A placeholder left in resolved params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedPlaceholder {
    /// Dotted/indexed path of the offending value, `<root>` for top level.
    pub param_key: String,
    /// The placeholder text, e.g. `${t1.output}`.
    pub raw_placeholder: String,
}

/// Every `${...}` token still present in `params`, in traversal order,
/// deduplicated.
pub fn collect_unresolved(params: &Params) -> Vec<UnresolvedPlaceholder> {
    let mut found = Vec::new();
    for (key, value) in params {
        collect_value(value, key, &mut found);
    }
    found
}

fn collect_value(value: &Value, path: &str, found: &mut Vec<UnresolvedPlaceholder>) {
    match value {
        Value::String(text) => {
            for token in PLACEHOLDER_RE.find_iter(text) {
                let entry = UnresolvedPlaceholder {
                    param_key: if path.is_empty() {
                        "<root>".to_string()
                    } else {
                        path.to_string()
                    },
                    raw_placeholder: token.as_str().to_string(),
                };
                if !found.contains(&entry) {
                    found.push(entry);
                }
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_value(item, &format!("{path}[{index}]"), found);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                collect_value(item, &child, found);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn resolve_value(value: &Value, context: &ExecutionContext) -> Value {
    match value {
        Value::String(text) => resolve_string(text, context),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, context))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), resolve_value(item, context)))
                .collect(),
        ),
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
    }
}

fn resolve_string(text: &str, context: &ExecutionContext) -> Value {
    if let Some(resolved) = whole_placeholder(text).and_then(|expr| lookup(expr, context)) {
        return resolved;
    }
    let replaced = PLACEHOLDER_RE.replace_all(text, |caps: &Captures<'_>| {
        match lookup(&caps[1], context) {
            Some(value) => value_text(&value),
            None => caps[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

/// Inner expression when `text` is exactly one placeholder.
fn whole_placeholder(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let caps = PLACEHOLDER_RE.captures(trimmed)?;
    let whole = caps.get(0)?;
    if whole.start() != 0 || whole.end() != trimmed.len() {
        return None;
    }
    caps.get(1).map(|m| m.as_str())
}

fn lookup(expression: &str, context: &ExecutionContext) -> Option<Value> {
    let expression = expression.trim();
    let (id, rest) = match expression.split_once('.') {
        Some((id, rest)) => (id.trim(), Some(rest.trim())),
        None => (expression, None),
    };
    let record = context.get(id)?;
    match rest {
        None | Some("output") => Some(Value::String(record.output.clone())),
        Some("summary") => Some(Value::String(record.summary.clone())),
        Some("success") => Some(Value::Bool(record.success)),
        Some("tool_calls_used") => Some(Value::from(record.tool_calls_used)),
        Some(path) => {
            let path = path.strip_prefix("output.").unwrap_or(path);
            lookup_output_path(record, path)
        }
    }
}

fn lookup_output_path(record: &TodoExecutionRecord, path: &str) -> Option<Value> {
    let root: Value = serde_json::from_str(record.output.trim()).ok()?;
    let mut current = &root;
    for segment in path.split('.') {
        let caps = PATH_SEGMENT_RE.captures(segment)?;
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if !name.is_empty() {
            current = current.get(name)?;
        }
        let indexes = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        for index in INDEX_RE.captures_iter(indexes) {
            let index: usize = index[1].parse().ok()?;
            current = current.get(index)?;
        }
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let mut context = ExecutionContext::new();
        context.insert(
            "t1".to_string(),
            TodoExecutionRecord::succeeded(
                r#"{"ok":true,"data":{"dataset_id":"ds_1","items":[{"code":"000300.SH"}]}}"#,
                "found index",
                1,
            ),
        );
        context.insert(
            "t2".to_string(),
            TodoExecutionRecord::succeeded("plain text", "notes", 0),
        );
        context
    }

    fn params(value: Value) -> Params {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn whole_string_placeholder_becomes_json_value() {
        let resolved = TemplateParamResolver.resolve(
            &params(json!({"first": "${t1.data.items[0]}", "ok": "${t1.success}"})),
            &context(),
        );
        assert_eq!(resolved.get("first"), Some(&json!({"code": "000300.SH"})));
        assert_eq!(resolved.get("ok"), Some(&json!(true)));
    }

    #[test]
    fn embedded_placeholders_are_substituted_as_text() {
        let resolved = TemplateParamResolver.resolve(
            &params(json!({"code": "df = load('${t1.output.data.dataset_id}') # ${t2.summary}"})),
            &context(),
        );
        assert_eq!(resolved.get("code"), Some(&json!("df = load('ds_1') # notes")));
    }

    #[test]
    fn nested_values_are_resolved_and_inputs_untouched() {
        let input = params(json!({"args": {"list": ["${t2}", 3]}}));
        let resolved = TemplateParamResolver.resolve(&input, &context());
        assert_eq!(resolved.get("args"), Some(&json!({"list": ["plain text", 3]})));
        assert_eq!(input.get("args"), Some(&json!({"list": ["${t2}", 3]})));
    }

    #[test]
    fn unknown_references_stay_and_are_collected_with_paths() {
        let resolved = TemplateParamResolver.resolve(
            &params(json!({
                "keyword": "${missing.output}",
                "nested": {"rows": ["ok", "${t1.data.nope}"]},
                "again": "${missing.output}"
            })),
            &context(),
        );
        let unresolved = collect_unresolved(&resolved);
        assert_eq!(
            unresolved,
            vec![
                UnresolvedPlaceholder {
                    param_key: "keyword".to_string(),
                    raw_placeholder: "${missing.output}".to_string(),
                },
                UnresolvedPlaceholder {
                    param_key: "nested.rows[1]".to_string(),
                    raw_placeholder: "${t1.data.nope}".to_string(),
                },
                UnresolvedPlaceholder {
                    param_key: "again".to_string(),
                    raw_placeholder: "${missing.output}".to_string(),
                },
            ]
        );
    }

    #[test]
    fn output_path_on_non_json_output_is_unresolved() {
        let resolved =
            TemplateParamResolver.resolve(&params(json!({"x": "${t2.data}"})), &context());
        assert_eq!(resolved.get("x"), Some(&json!("${t2.data}")));
    }
}
