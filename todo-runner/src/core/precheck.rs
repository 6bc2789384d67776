//! Deterministic static precheck for sandboxed code execution.
//!
//! Runs before the sandbox is invoked, so a failure here costs no tool-call
//! quota.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

use crate::core::run_args::{is_valid_dataset_id, split_dataset_ids};
use crate::core::types::Params;

pub const STATIC_PRECHECK_FAILED: &str = "STATIC_PRECHECK_FAILED";

static DATASET_ID_INTERPOLATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\s*dataset_id\s*\}").expect("interpolation regex"));
static DATASET_ID_ASSIGNMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bdataset_id\s*=").expect("assignment regex"));
static FORBIDDEN_DATASETS_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(^|[^A-Za-z0-9_])/datasets(/|\b)").expect("datasets path regex")
});

#[derive(Debug, Clone, PartialEq)]
pub struct PrecheckOutcome {
    pub passed: bool,
    pub issues: Vec<String>,
    /// `{code_length, dataset_ids, run_args, issues}`.
    pub report: Value,
}

impl PrecheckOutcome {
    /// `STATIC_PRECHECK_FAILED: <issues joined by "; ">`.
    pub fn summary(&self) -> String {
        format!("{STATIC_PRECHECK_FAILED}: {}", self.issues.join("; "))
    }
}

/// Pre-execution gate for the code-execution tool.
pub trait StaticPrecheck: Send + Sync {
    fn check(&self, code: &str, dataset_ids: &str, run_args: &Params) -> PrecheckOutcome;
}

/// Default precheck over code text and dataset ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatasetCodePrecheck;

impl StaticPrecheck for DatasetCodePrecheck {
    fn check(&self, code: &str, dataset_ids: &str, run_args: &Params) -> PrecheckOutcome {
        let mut issues = Vec::new();
        let code_present = !code.trim().is_empty();
        if !code_present {
            issues.push("code must not be empty".to_string());
        }

        let mut ids: Vec<String> = Vec::new();
        let entries = split_dataset_ids(dataset_ids);
        if entries.is_empty() {
            issues.push("dataset_id must not be empty".to_string());
        }
        for entry in entries {
            if !is_valid_dataset_id(&entry) {
                issues.push(format!(
                    "dataset_id '{entry}' is invalid: only letters, digits, '.', '_' and '-' are allowed"
                ));
            } else if !ids.contains(&entry) {
                ids.push(entry);
            }
        }

        if code_present && FORBIDDEN_DATASETS_PATH_RE.is_match(code) {
            issues.push(
                "code must not read the raw /datasets path; use /sandbox/input/<dataset_id>/... and write outputs under /tmp"
                    .to_string(),
            );
        }
        if code_present
            && DATASET_ID_INTERPOLATION_RE.is_match(code)
            && !DATASET_ID_ASSIGNMENT_RE.is_match(code)
        {
            issues.push("code interpolates dataset_id without assigning it first".to_string());
        }

        let report = json!({
            "code_length": code.chars().count(),
            "dataset_ids": ids,
            "run_args": run_args,
            "issues": issues,
        });
        PrecheckOutcome {
            passed: issues.is_empty(),
            issues,
            report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(code: &str, ids: &str) -> PrecheckOutcome {
        DatasetCodePrecheck.check(code, ids, &Params::new())
    }

    #[test]
    fn clean_code_passes_with_report() {
        let outcome = check("import pandas as pd\nprint(1)", "ds_1, ds-2,ds_1");
        assert!(outcome.passed);
        assert_eq!(outcome.report["dataset_ids"], json!(["ds_1", "ds-2"]));
        assert_eq!(outcome.report["code_length"], json!(28));
        assert_eq!(outcome.report["issues"], json!([]));
    }

    #[test]
    fn blank_code_and_missing_ids_fail() {
        let outcome = check("   ", "");
        assert!(!outcome.passed);
        assert_eq!(outcome.issues.len(), 2);
        assert!(outcome.summary().starts_with("STATIC_PRECHECK_FAILED: code must not be empty; "));
    }

    #[test]
    fn invalid_id_is_reported_by_name() {
        let outcome = check("print(1)", "[ok_1, bad id!]");
        assert!(!outcome.passed);
        assert!(outcome.issues[0].contains("'bad id!'"));
        assert_eq!(outcome.report["dataset_ids"], json!(["ok_1"]));
    }

    #[test]
    fn raw_datasets_path_is_rejected() {
        assert!(!check("open('/datasets/ds_1/data.csv')", "ds_1").passed);
        assert!(!check("open('/DATASETS')", "ds_1").passed);
        assert!(check("open('/sandbox/input/ds_1/my_datasets/x.csv')", "ds_1").passed);
    }

    #[test]
    fn undefined_dataset_id_interpolation_is_rejected() {
        let undefined = check("path = f'/sandbox/input/{dataset_id}/a.csv'", "ds_1");
        assert!(!undefined.passed);
        assert!(undefined.issues[0].contains("without assigning"));

        let defined = check(
            "dataset_id = 'ds_1'\npath = f'/sandbox/input/{ dataset_id }/a.csv'",
            "ds_1",
        );
        assert!(defined.passed);
    }
}
