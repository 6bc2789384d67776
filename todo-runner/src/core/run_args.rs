//! Normalization of sandbox run arguments.
//!
//! Run args carry at most three keys: `dataset_ids` (comma-joined, validated),
//! `libraries` (passed through) and `timeout_seconds` (clamped).

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

use crate::core::text::{first_int, first_non_blank, value_text};
use crate::core::types::Params;

pub const DEFAULT_TIMEOUT_SECONDS: u32 = 90;
pub const MIN_TIMEOUT_SECONDS: u32 = 60;
pub const MAX_TIMEOUT_SECONDS: u32 = 300;

/// Keys accepted for dataset ids, plural forms first.
pub const DATASET_ID_KEYS: &[&str] = &["dataset_ids", "datasetIds", "dataset_id", "datasetId"];
const TIMEOUT_KEYS: &[&str] = &["timeout_seconds", "timeoutSeconds"];

static DATASET_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("dataset id regex"));

pub fn is_valid_dataset_id(id: &str) -> bool {
    DATASET_ID_RE.is_match(id)
}

/// Parse a dataset id list.
///
/// Accepts `a,b`, `[a, b]` and quoted entries. Invalid entries are dropped,
/// duplicates removed, order preserved.
pub fn parse_dataset_ids(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in split_dataset_ids(raw) {
        if is_valid_dataset_id(&id) && !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Non-empty entries of a dataset id list, unvalidated.
pub fn split_dataset_ids(raw: &str) -> Vec<String> {
    let mut trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('[') && trimmed.ends_with(']') {
        trimmed = &trimmed[1..trimmed.len() - 1];
    }
    trimmed
        .split(',')
        .map(|entry| entry.trim().trim_matches(|c| c == '"' || c == '\'').trim())
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Comma-joined form of [`parse_dataset_ids`].
pub fn normalize_dataset_ids(raw: &str) -> String {
    parse_dataset_ids(raw).join(",")
}

/// Clamp a timeout into the allowed window. Missing or non-positive values
/// take the default.
pub fn clamp_timeout(timeout: Option<i64>) -> u32 {
    match timeout {
        None => DEFAULT_TIMEOUT_SECONDS,
        Some(secs) if secs <= 0 => DEFAULT_TIMEOUT_SECONDS,
        Some(secs) => secs.clamp(i64::from(MIN_TIMEOUT_SECONDS), i64::from(MAX_TIMEOUT_SECONDS)) as u32,
    }
}

/// Reduce raw arguments to the canonical run-args shape.
///
/// `timeout_seconds` is always present afterwards.
pub fn sanitize_run_args(raw: &Params) -> Params {
    let mut out = Params::new();
    let ids = normalize_dataset_ids(&first_non_blank(raw, DATASET_ID_KEYS));
    if !ids.is_empty() {
        out.insert("dataset_ids".to_string(), Value::String(ids));
    }
    let libraries = raw.get("libraries").map(value_text).unwrap_or_default();
    if !libraries.trim().is_empty() {
        out.insert("libraries".to_string(), Value::String(libraries.trim().to_string()));
    }
    out.insert(
        "timeout_seconds".to_string(),
        json!(clamp_timeout(first_int(raw, TIMEOUT_KEYS))),
    );
    out
}

/// Overlay `overrides` onto `base`; keys present in `overrides` win.
///
/// Keys the override does not mention keep the base value, so a model that
/// only changes `libraries` does not reset the timeout.
pub fn merge_run_args(base: &Params, overrides: &Params) -> Params {
    let mut merged = sanitize_run_args(base);
    let ids = normalize_dataset_ids(&first_non_blank(overrides, DATASET_ID_KEYS));
    if !ids.is_empty() {
        merged.insert("dataset_ids".to_string(), Value::String(ids));
    }
    let libraries = overrides.get("libraries").map(value_text).unwrap_or_default();
    if !libraries.trim().is_empty() {
        merged.insert("libraries".to_string(), Value::String(libraries.trim().to_string()));
    }
    if let Some(timeout) = first_int(overrides, TIMEOUT_KEYS) {
        merged.insert("timeout_seconds".to_string(), json!(clamp_timeout(Some(timeout))));
    }
    merged
}

/// Dates with exactly 8 or 13 digits compact to those digits; anything else
/// is returned trimmed.
pub fn compact_date(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 8 || digits.len() == 13 {
        digits
    } else {
        raw.trim().to_string()
    }
}
