//! Extraction of structured payloads from free-form model text.
//!
//! Fallback order for [`extract_structured_payload`]:
//! 1. the first fenced block tagged `json` (or untagged),
//! 2. the slice from the first `{` to the last `}`,
//! 3. the trimmed raw text.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::types::Params;

static JSON_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*(?i:json)?[ \t]*\r?\n(.*?)```").expect("json fence regex")
});

static PYTHON_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```(?:python)?\s*(.*?)```").expect("python fence regex")
});

/// Best-effort structured payload candidate from model text.
pub fn extract_structured_payload(text: &str) -> &str {
    if let Some(block) = JSON_FENCE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|block| !block.is_empty())
    {
        return block;
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text.trim(),
    }
}

/// Parse model text into a JSON object, or `None` when no object is found.
pub fn parse_json_object(text: &str) -> Option<Params> {
    if text.trim().is_empty() {
        return None;
    }
    let candidate = extract_structured_payload(text);
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => {
            // A fenced block that is not an object may still wrap one.
            let (start, end) = (candidate.find('{')?, candidate.rfind('}')?);
            if end <= start {
                return None;
            }
            match serde_json::from_str::<Value>(&candidate[start..=end]) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            }
        }
    }
}

/// True when `output` is a JSON object whose `ok` field is `true`.
pub fn is_ok_payload(output: &str) -> bool {
    match serde_json::from_str::<Value>(output.trim()) {
        Ok(Value::Object(map)) => map.get("ok").and_then(Value::as_bool).unwrap_or(false),
        _ => false,
    }
}

/// Code from a generation response: JSON `code` field, then a python fence,
/// then the raw text.
pub fn extract_code(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }
    if let Some(code) = parse_json_object(text)
        .as_ref()
        .and_then(|obj| obj.get("code"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|code| !code.is_empty())
    {
        return code.to_string();
    }
    if let Some(block) = PYTHON_FENCE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|block| !block.is_empty())
    {
        return block.to_string();
    }
    text.trim().to_string()
}

/// `run_args` object from a generation response, empty when absent.
pub fn extract_run_args(text: &str) -> Params {
    parse_json_object(text)
        .and_then(|mut obj| obj.remove("run_args"))
        .and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_json_block_wins() {
        let text = "Here you go {not this}\n```json\n{\"params\": {\"a\": 1}}\n```\ntrailing }";
        assert_eq!(extract_structured_payload(text), "{\"params\": {\"a\": 1}}");
    }

    #[test]
    fn brace_slice_used_without_fence() {
        let text = "sure: {\"abandon\": true} thanks";
        assert_eq!(extract_structured_payload(text), "{\"abandon\": true}");
    }

    #[test]
    fn raw_text_is_last_resort() {
        assert_eq!(extract_structured_payload("  no json here  "), "no json here");
    }

    #[test]
    fn parse_json_object_rejects_arrays_and_prose() {
        assert!(parse_json_object("[1, 2]").is_none());
        assert!(parse_json_object("nothing").is_none());
        assert!(parse_json_object("").is_none());
        let obj = parse_json_object("```\n{\"pass\": true}\n```").expect("object");
        assert_eq!(obj.get("pass"), Some(&json!(true)));
    }

    #[test]
    fn ok_payload_requires_boolean_true() {
        assert!(is_ok_payload("{\"ok\": true, \"data\": {}}"));
        assert!(!is_ok_payload("{\"ok\": \"true\"}"));
        assert!(!is_ok_payload("{\"ok\": false}"));
        assert!(!is_ok_payload("not json"));
        assert!(!is_ok_payload("[{\"ok\": true}]"));
    }

    #[test]
    fn extract_code_prefers_json_then_fence_then_raw() {
        let json_text = "{\"code\": \"print(1)\", \"run_args\": {\"libraries\": \"pandas\"}}";
        assert_eq!(extract_code(json_text), "print(1)");

        let fenced = "Try this:\n```python\nimport pandas as pd\nprint(2)\n```";
        assert_eq!(extract_code(fenced), "import pandas as pd\nprint(2)");

        assert_eq!(extract_code("  print(3)  "), "print(3)");
        assert_eq!(extract_code("   "), "");
    }

    #[test]
    fn extract_run_args_reads_nested_object() {
        let text = "{\"code\": \"x\", \"run_args\": {\"timeout_seconds\": 120}}";
        let args = extract_run_args(text);
        assert_eq!(args.get("timeout_seconds"), Some(&json!(120)));
        assert!(extract_run_args("{\"code\": \"x\"}").is_empty());
    }
}
