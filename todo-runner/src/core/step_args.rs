//! Per-tool argument normalization for sub-agent steps.
//!
//! Planner models use inconsistent argument names. Each known tool collapses
//! its aliases onto the canonical keys before execution; unknown tools pass
//! through unchanged.

use serde_json::Value;

use crate::core::payload::parse_json_object;
use crate::core::run_args::{compact_date, parse_dataset_ids};
use crate::core::text::{first_non_blank, value_text};
use crate::core::types::{CODE_EXECUTION_TOOL, Params, SubAgentStep};

const SEARCH_TOOLS: &[&str] = &["searchIndex", "searchStock", "searchFund"];
const DAILY_TOOLS: &[&str] = &["getIndexDaily", "getStockDaily"];

/// Keys the planner may use to hand a curated context to code generation.
pub const CODING_CONTEXT_KEYS: &[&str] = &[
    "coding_context",
    "codingContext",
    "analysis_context",
    "analysisContext",
    "related_context",
    "relatedContext",
    "input_context",
    "inputContext",
    "context",
];

/// Normalize `raw` args for `tool` given earlier steps and the seed args of
/// the delegating todo.
pub fn normalize_step_args(
    tool: &str,
    raw: &Params,
    prior_steps: &[SubAgentStep],
    seed: &Params,
) -> Params {
    let mut args = raw.clone();
    if SEARCH_TOOLS.contains(&tool) {
        let keyword = first_non_blank(&args, &["keyword", "query", "q", "name", "arg0"]);
        set_text(&mut args, "keyword", keyword);
    }
    if DAILY_TOOLS.contains(&tool) {
        let ts_code = first_non_blank(
            &args,
            &["tsCode", "ts_code", "code", "index_code", "stock_code", "arg0"],
        );
        let start = compact_date(&first_non_blank(
            &args,
            &["startDateStr", "startDate", "start_date", "arg1"],
        ));
        let end = compact_date(&first_non_blank(
            &args,
            &["endDateStr", "endDate", "end_date", "arg2"],
        ));
        set_text(&mut args, "tsCode", ts_code);
        set_text(&mut args, "startDateStr", start);
        set_text(&mut args, "endDateStr", end);
    }
    if tool == CODE_EXECUTION_TOOL {
        normalize_code_execution(&mut args, prior_steps, seed);
    }
    args
}

fn normalize_code_execution(args: &mut Params, prior_steps: &[SubAgentStep], seed: &Params) {
    let mut available: Vec<String> = Vec::new();
    let seed_id = first_non_blank(seed, &["dataset_id", "datasetId", "arg1"]);
    push_unique(&mut available, seed_id);
    for id in parse_dataset_ids(&first_non_blank(seed, &["dataset_ids", "datasetIds", "arg2"])) {
        push_unique(&mut available, id);
    }
    for id in discovered_dataset_ids(prior_steps) {
        push_unique(&mut available, id);
    }

    let mut dataset_id = first_non_blank(args, &["dataset_id", "datasetId", "arg1"]);
    if let Some(first) = available.first() {
        if dataset_id.is_empty() || !available.contains(&dataset_id) {
            dataset_id = first.clone();
        }
    }
    set_text(args, "dataset_id", dataset_id.clone());

    let mut merged: Vec<String> = Vec::new();
    push_unique(&mut merged, dataset_id);
    for id in parse_dataset_ids(&first_non_blank(args, &["dataset_ids", "datasetIds", "arg2"])) {
        push_unique(&mut merged, id);
    }
    for id in available {
        push_unique(&mut merged, id);
    }
    if !merged.is_empty() {
        args.insert("dataset_ids".to_string(), Value::String(merged.join(",")));
    }

    let mut code = first_non_blank(args, &["code", "arg0"]);
    if code.is_empty() {
        code = first_non_blank(seed, &["code", "arg0"]);
    }
    set_text(args, "code", code);
}

/// Dataset ids announced by earlier successful outputs under `data.dataset_id`
/// and `data.dataset_ids`, in order of appearance.
pub fn discovered_dataset_ids(steps: &[SubAgentStep]) -> Vec<String> {
    let mut ids = Vec::new();
    for step in steps {
        for id in step_dataset_ids(step) {
            push_unique(&mut ids, id);
        }
    }
    ids
}

/// One hint line per discovered dataset, e.g.
/// `- dataset_id=ds_1 (tool=getIndexDaily) (tsCode=000300.SH) (rows=242)`.
pub fn dataset_hints(steps: &[SubAgentStep]) -> String {
    let mut lines: Vec<String> = Vec::new();
    for step in steps {
        let ids = step_dataset_ids(step);
        if ids.is_empty() {
            continue;
        }
        let data = ok_data(step).unwrap_or_default();
        let data_text = |key: &str| data.get(key).map(value_text).unwrap_or_default();
        let mut ts_code = data_text("ts_code");
        if ts_code.trim().is_empty() {
            ts_code = first_non_blank(&step.args, &["tsCode", "ts_code", "code"]);
        }
        let rows = data_text("rows");
        let (start, end) = (data_text("start_date"), data_text("end_date"));
        let fields = match data.get("fields") {
            Some(fields @ Value::Array(_)) => fields.to_string(),
            _ => String::new(),
        };
        for id in ids {
            let mut line = format!("- dataset_id={id}");
            if !step.tool.is_empty() {
                line.push_str(&format!(" (tool={})", step.tool));
            }
            if !ts_code.trim().is_empty() {
                line.push_str(&format!(" (tsCode={})", ts_code.trim()));
            }
            if !rows.is_empty() {
                line.push_str(&format!(" (rows={rows})"));
            }
            if !start.is_empty() && !end.is_empty() {
                line.push_str(&format!(" (range={start}~{end})"));
            }
            if !fields.is_empty() {
                line.push_str(&format!(" (fields={fields})"));
            }
            if !lines.contains(&line) {
                lines.push(line);
            }
        }
    }
    lines.join("\n")
}

fn ok_data(step: &SubAgentStep) -> Option<Params> {
    let root = parse_json_object(&step.output)?;
    if root.get("ok").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    match root.get("data") {
        Some(Value::Object(data)) => Some(data.clone()),
        _ => None,
    }
}

fn step_dataset_ids(step: &SubAgentStep) -> Vec<String> {
    let Some(data) = ok_data(step) else {
        return Vec::new();
    };
    let mut ids = Vec::new();
    if let Some(id) = data.get("dataset_id").map(value_text) {
        push_unique(&mut ids, id.trim().to_string());
    }
    if let Some(Value::Array(items)) = data.get("dataset_ids") {
        for item in items {
            push_unique(&mut ids, value_text(item).trim().to_string());
        }
    }
    ids
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

fn set_text(args: &mut Params, key: &str, value: String) {
    if !value.is_empty() {
        args.insert(key.to_string(), Value::String(value));
    }
}
