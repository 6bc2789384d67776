//! Small text helpers shared by the executor and the agents.

use serde_json::Value;

use crate::core::types::Params;

/// Preview limit for tool results in events and record summaries.
pub const RESULT_PREVIEW_CHARS: usize = 500;
/// Preview limit for sub-agent step failures.
pub const STEP_PREVIEW_CHARS: usize = 300;
/// Preview limit for execution feedback in the refinement history.
pub const FEEDBACK_PREVIEW_CHARS: usize = 5000;

/// First `limit` characters of `text`.
pub fn preview(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

/// Plain-text rendering of a parameter value. `null` renders empty; arrays
/// and objects render as compact JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Trimmed text of the first key whose value is non-blank.
pub fn first_non_blank(params: &Params, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| params.get(*key))
        .map(value_text)
        .map(|text| text.trim().to_string())
        .find(|text| !text.is_empty())
        .unwrap_or_default()
}

/// First integer among `keys`, accepting numeric strings.
pub fn first_int(params: &Params, keys: &[&str]) -> Option<i64> {
    keys.iter().filter_map(|key| params.get(*key)).find_map(|value| match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    })
}
