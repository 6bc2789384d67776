//! LLM-as-judge over successful code-execution results.

use std::sync::{Arc, LazyLock};

use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::core::payload::extract_structured_payload;
use crate::core::tags::{ExecutionTags, PHASE_JUDGE};
use crate::core::types::{Params, TodoItem};
use crate::io::config::JudgeConfig;
use crate::io::llm::{ChatModel, ChatRequest, ModelHandle, ModelProvider};
use crate::io::prompt::PromptEngine;

use super::{compile_schema, schema_errors};

static VERDICT_SCHEMA: LazyLock<Validator> = LazyLock::new(|| {
    compile_schema(include_str!(
        "../../schemas/semantic_judge_verdict.schema.json"
    ))
});

const JUDGE_STAGE: &str = "semantic_judge";
const INVALID_VERDICT_REASON: &str = "语义评审未返回有效结论";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JudgeCategory {
    Ok,
    NumericAnomaly,
    TimeRangeMismatch,
    DomainInvariantViolation,
    InsufficientEvidence,
}

impl JudgeCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NumericAnomaly => "NUMERIC_ANOMALY",
            Self::TimeRangeMismatch => "TIME_RANGE_MISMATCH",
            Self::DomainInvariantViolation => "DOMAIN_INVARIANT_VIOLATION",
            Self::InsufficientEvidence => "INSUFFICIENT_EVIDENCE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JudgeSeverity {
    Low,
    Medium,
    High,
}

impl JudgeSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

/// A schema-valid judge reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Verdict {
    pass: bool,
    category: JudgeCategory,
    severity: JudgeSeverity,
    reason_cn: String,
    fix_hint: String,
}

pub struct JudgeRequest<'a> {
    pub user_goal: &'a str,
    pub todo: &'a TodoItem,
    pub run_args: &'a Params,
    pub code: &'a str,
    pub tool_output: &'a str,
    pub config: &'a JudgeConfig,
    /// Fallback when no configured route resolves.
    pub primary: &'a ModelHandle,
    pub tags: &'a ExecutionTags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeOutcome {
    pub passed: bool,
    pub category: JudgeCategory,
    pub severity: JudgeSeverity,
    pub reason_cn: String,
    pub fix_hint: String,
    /// `{attempt, max_attempts, judge_model, judge_endpoint, reason_cn,
    /// fix_hint, raw, failures}`.
    pub report: Value,
}

impl JudgeOutcome {
    /// `SEMANTIC_JUDGE_REJECTED: <category>, <reason>`.
    pub fn rejection_summary(&self) -> String {
        format!(
            "SEMANTIC_JUDGE_REJECTED: {}, {}",
            self.category.as_str(),
            self.reason_cn
        )
    }
}

pub trait SemanticJudge: Send + Sync {
    fn judge(&self, request: &JudgeRequest<'_>) -> JudgeOutcome;
}

/// Judge backed by chat models from the configured routes.
pub struct LlmSemanticJudge {
    models: Arc<dyn ModelProvider>,
    prompts: PromptEngine,
}

struct SelectedModel {
    model: Arc<dyn ChatModel>,
    endpoint: String,
    name: String,
}

impl LlmSemanticJudge {
    pub fn new(models: Arc<dyn ModelProvider>) -> Self {
        Self {
            models,
            prompts: PromptEngine::new(),
        }
    }

    /// First route candidate (endpoint × models, in order) that resolves,
    /// otherwise the run's primary model.
    fn select_model(&self, config: &JudgeConfig, primary: &ModelHandle) -> SelectedModel {
        for route in &config.routes {
            for name in &route.models {
                match self
                    .models
                    .resolve(&route.endpoint, name, Some(config.temperature))
                {
                    Ok(model) => {
                        return SelectedModel {
                            model,
                            endpoint: route.endpoint.clone(),
                            name: name.clone(),
                        };
                    }
                    Err(err) => {
                        debug!(endpoint = %route.endpoint, model = %name, error = %format!("{err:#}"), "judge route unavailable");
                    }
                }
            }
        }
        SelectedModel {
            model: primary.model.clone(),
            endpoint: primary.endpoint.clone(),
            name: primary.model_name.clone(),
        }
    }

    fn user_payload(request: &JudgeRequest<'_>, attempt: u32) -> Value {
        let tool_output = serde_json::from_str::<Value>(request.tool_output.trim())
            .unwrap_or_else(|_| Value::String(request.tool_output.to_string()));
        json!({
            "user_goal": request.user_goal,
            "todo": {
                "id": request.todo.id,
                "tool": request.todo.tool_name(),
                "reasoning": request.todo.reasoning,
            },
            "run_args": request.run_args,
            "code": request.code,
            "tool_output": tool_output,
            "judge_attempt": attempt,
        })
    }
}

impl SemanticJudge for LlmSemanticJudge {
    fn judge(&self, request: &JudgeRequest<'_>) -> JudgeOutcome {
        let config = request.config;
        let max_attempts = config.max_attempts.max(1);
        let tags = request.tags.with_phase(PHASE_JUDGE).with_stage(JUDGE_STAGE);
        let mut failures: Vec<Value> = Vec::new();
        let mut last_model = (String::new(), String::new());

        for attempt in 1..=max_attempts {
            let selected = self.select_model(config, request.primary);
            last_model = (selected.endpoint.clone(), selected.name.clone());

            let system = match self.prompts.judge_system() {
                Ok(system) => system,
                Err(err) => {
                    failures.push(json!({"attempt": attempt, "error": format!("prompt_error: {err:#}")}));
                    continue;
                }
            };
            let user = serde_json::to_string_pretty(&Self::user_payload(request, attempt))
                .unwrap_or_default();
            let response = match selected
                .model
                .generate(&ChatRequest::prompt(system, user, tags.clone()))
            {
                Ok(response) => response,
                Err(err) => {
                    warn!(attempt, error = %format!("{err:#}"), "judge call failed");
                    failures.push(json!({"attempt": attempt, "error": format!("llm_error: {err:#}")}));
                    continue;
                }
            };

            let (verdict, raw) = match parse_verdict(&response.text) {
                Ok(parsed) => parsed,
                Err(failure) => {
                    debug!(attempt, error = %failure.code, "judge verdict invalid");
                    failures.push(json!({
                        "attempt": attempt,
                        "error": failure.code,
                        "detail": failure.detail,
                        "raw": response.text,
                    }));
                    continue;
                }
            };

            let report = json!({
                "attempt": attempt,
                "max_attempts": max_attempts,
                "judge_model": selected.name,
                "judge_endpoint": selected.endpoint,
                "reason_cn": verdict.reason_cn,
                "fix_hint": verdict.fix_hint,
                "raw": raw,
                "failures": failures,
            });
            let passed = verdict.pass
                || (verdict.category == JudgeCategory::InsufficientEvidence
                    && !config.block_on_insufficient_evidence);
            info!(
                attempt,
                passed,
                category = verdict.category.as_str(),
                "semantic judge verdict"
            );
            return JudgeOutcome {
                passed,
                category: verdict.category,
                severity: verdict.severity,
                reason_cn: verdict.reason_cn,
                fix_hint: verdict.fix_hint,
                report,
            };
        }

        warn!(attempts = max_attempts, fail_open = config.fail_open, "no valid judge verdict");
        let report = json!({
            "attempt": max_attempts,
            "max_attempts": max_attempts,
            "judge_model": last_model.1,
            "judge_endpoint": last_model.0,
            "reason_cn": INVALID_VERDICT_REASON,
            "fix_hint": "",
            "raw": Value::Null,
            "failures": failures,
        });
        JudgeOutcome {
            passed: config.fail_open,
            category: JudgeCategory::InsufficientEvidence,
            severity: if config.fail_open {
                JudgeSeverity::Low
            } else {
                JudgeSeverity::High
            },
            reason_cn: INVALID_VERDICT_REASON.to_string(),
            fix_hint: String::new(),
            report,
        }
    }
}

struct VerdictFailure {
    code: &'static str,
    detail: String,
}

fn parse_verdict(text: &str) -> Result<(Verdict, Value), VerdictFailure> {
    let raw: Value = serde_json::from_str(extract_structured_payload(text)).map_err(|err| {
        VerdictFailure {
            code: "judge_output_not_object",
            detail: err.to_string(),
        }
    })?;
    let errors = schema_errors(&VERDICT_SCHEMA, &raw);
    if !errors.is_empty() {
        return Err(VerdictFailure {
            code: first_field_error(&raw),
            detail: errors.join("; "),
        });
    }
    let verdict: Verdict = serde_json::from_value(raw.clone()).map_err(|err| VerdictFailure {
        code: first_field_error(&raw),
        detail: err.to_string(),
    })?;
    Ok((verdict, raw))
}

/// Error code of the first offending field, in field order.
fn first_field_error(raw: &Value) -> &'static str {
    let Some(obj) = raw.as_object() else {
        return "judge_output_not_object";
    };
    let is_one_of = |key: &str, allowed: &[&str]| {
        obj.get(key)
            .and_then(Value::as_str)
            .is_some_and(|value| allowed.contains(&value))
    };
    if !obj.get("pass").is_some_and(Value::is_boolean) {
        return "judge_output_missing_pass";
    }
    if !is_one_of(
        "category",
        &[
            "OK",
            "NUMERIC_ANOMALY",
            "TIME_RANGE_MISMATCH",
            "DOMAIN_INVARIANT_VIOLATION",
            "INSUFFICIENT_EVIDENCE",
        ],
    ) {
        return "judge_output_invalid_category";
    }
    if !is_one_of("severity", &["LOW", "MEDIUM", "HIGH"]) {
        return "judge_output_invalid_severity";
    }
    if !obj
        .get("reason_cn")
        .and_then(Value::as_str)
        .is_some_and(|reason| !reason.trim().is_empty())
    {
        return "judge_output_missing_reason_cn";
    }
    if !obj.get("fix_hint").is_some_and(Value::is_string) {
        return "judge_output_missing_fix_hint";
    }
    "judge_output_schema_invalid"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::{JudgeRoute, WorkflowConfig};
    use crate::test_support::{
        ScriptedChatModel, StaticModelProvider, model_handle, params, tool_item,
    };

    const PASS: &str = r#"{"pass": true, "category": "OK", "severity": "LOW", "reason_cn": "结果合理", "fix_hint": ""}"#;
    const ANOMALY: &str = r#"```json
{"pass": false, "category": "NUMERIC_ANOMALY", "severity": "HIGH", "reason_cn": "收益率超过1000%", "fix_hint": "check units"}
```"#;
    const INSUFFICIENT: &str = r#"{"pass": false, "category": "INSUFFICIENT_EVIDENCE", "severity": "MEDIUM", "reason_cn": "输出缺少数值", "fix_hint": "print values"}"#;

    fn judge_config() -> JudgeConfig {
        let mut config = WorkflowConfig::default().judge;
        config.enabled = true;
        config
    }

    fn run(judge: &LlmSemanticJudge, config: &JudgeConfig, primary: &ModelHandle) -> JudgeOutcome {
        let todo = tool_item("t1", 1, "executePython", json!({"code": "print(1)"}));
        let run_args = params(json!({"dataset_ids": "ds_1"}));
        let tags = ExecutionTags::for_run("run-1", "user-1");
        judge.judge(&JudgeRequest {
            user_goal: "average return",
            todo: &todo,
            run_args: &run_args,
            code: "print(1)",
            tool_output: r#"{"ok":true,"data":{"ret":12.0}}"#,
            config,
            primary,
            tags: &tags,
        })
    }

    #[test]
    fn passing_verdict_attaches_report() {
        let primary = Arc::new(ScriptedChatModel::new([PASS]));
        let judge = LlmSemanticJudge::new(Arc::new(StaticModelProvider::default()));

        let outcome = run(&judge, &judge_config(), &model_handle(&primary));

        assert!(outcome.passed);
        assert_eq!(outcome.category, JudgeCategory::Ok);
        assert_eq!(outcome.report["judge_model"], json!("primary-model"));
        assert_eq!(outcome.report["attempt"], json!(1));
        let payload: Value =
            serde_json::from_str(primary.requests()[0].user_text()).expect("payload json");
        assert_eq!(payload["todo"]["tool"], json!("executePython"));
        assert_eq!(payload["tool_output"]["data"]["ret"], json!(12.0));
        assert_eq!(payload["judge_attempt"], json!(1));
    }

    #[test]
    fn anomaly_verdict_rejects() {
        let primary = Arc::new(ScriptedChatModel::new([ANOMALY]));
        let judge = LlmSemanticJudge::new(Arc::new(StaticModelProvider::default()));

        let outcome = run(&judge, &judge_config(), &model_handle(&primary));

        assert!(!outcome.passed);
        assert_eq!(outcome.severity, JudgeSeverity::High);
        assert_eq!(
            outcome.rejection_summary(),
            "SEMANTIC_JUDGE_REJECTED: NUMERIC_ANOMALY, 收益率超过1000%"
        );
    }

    #[test]
    fn insufficient_evidence_blocks_only_when_configured() {
        let judge = LlmSemanticJudge::new(Arc::new(StaticModelProvider::default()));
        let mut config = judge_config();

        let primary = Arc::new(ScriptedChatModel::new([INSUFFICIENT]));
        assert!(run(&judge, &config, &model_handle(&primary)).passed);

        config.block_on_insufficient_evidence = true;
        let primary = Arc::new(ScriptedChatModel::new([INSUFFICIENT]));
        assert!(!run(&judge, &config, &model_handle(&primary)).passed);
    }

    /// Verifies an invalid first reply is recorded and the second attempt is
    /// used.
    #[test]
    fn invalid_verdict_is_retried() {
        let primary = Arc::new(ScriptedChatModel::new([
            r#"{"pass": false, "category": "WRONG", "severity": "LOW", "reason_cn": "x", "fix_hint": ""}"#,
            PASS,
        ]));
        let judge = LlmSemanticJudge::new(Arc::new(StaticModelProvider::default()));

        let outcome = run(&judge, &judge_config(), &model_handle(&primary));

        assert!(outcome.passed);
        assert_eq!(outcome.report["attempt"], json!(2));
        let failures = outcome.report["failures"].as_array().expect("failures");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0]["error"], json!("judge_output_invalid_category"));
    }

    #[test]
    fn exhausted_attempts_follow_fail_open() {
        let judge = LlmSemanticJudge::new(Arc::new(StaticModelProvider::default()));
        let mut config = judge_config();

        let primary = Arc::new(ScriptedChatModel::new(["not json", r#"{"pass": true}"#]));
        let open = run(&judge, &config, &model_handle(&primary));
        assert!(open.passed);
        assert_eq!(open.category, JudgeCategory::InsufficientEvidence);
        let failures = open.report["failures"].as_array().expect("failures");
        assert_eq!(failures[0]["error"], json!("judge_output_not_object"));
        assert_eq!(failures[1]["error"], json!("judge_output_invalid_category"));

        config.fail_open = false;
        let primary = Arc::new(ScriptedChatModel::default());
        let closed = run(&judge, &config, &model_handle(&primary));
        assert!(!closed.passed);
        assert_eq!(closed.severity, JudgeSeverity::High);
        assert_eq!(primary.calls(), 2);
    }

    #[test]
    fn first_resolvable_route_is_used() {
        let routed = Arc::new(ScriptedChatModel::new([PASS]));
        let provider = Arc::new(StaticModelProvider::default().with_model(
            "judge-endpoint",
            "judge-b",
            routed.clone(),
        ));
        let judge = LlmSemanticJudge::new(provider.clone());
        let mut config = judge_config();
        config.routes = vec![JudgeRoute {
            endpoint: "judge-endpoint".to_string(),
            models: vec!["judge-a".to_string(), "judge-b".to_string()],
        }];
        let primary = Arc::new(ScriptedChatModel::default());

        let outcome = run(&judge, &config, &model_handle(&primary));

        assert!(outcome.passed);
        assert_eq!(outcome.report["judge_model"], json!("judge-b"));
        assert_eq!(outcome.report["judge_endpoint"], json!("judge-endpoint"));
        assert_eq!(primary.calls(), 0);
        assert_eq!(routed.calls(), 1);
        assert_eq!(
            provider.resolved(),
            vec![
                ("judge-endpoint".to_string(), "judge-a".to_string()),
                ("judge-endpoint".to_string(), "judge-b".to_string()),
            ]
        );
    }
}
