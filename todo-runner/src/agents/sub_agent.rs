//! Sub-agent runner: plan a short tool sequence, execute it, summarize.
//!
//! The plan is validated before anything runs; an invalid plan is sent back
//! to the model with the rejection reason, up to the configured number of
//! planning attempts. Steps run strictly in order and the first failing step
//! aborts the run.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use jsonschema::Validator;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::payload::{extract_structured_payload, is_ok_payload};
use crate::core::placeholder::{ParamResolver, collect_unresolved};
use crate::core::step_args::{CODING_CONTEXT_KEYS, dataset_hints, normalize_step_args};
use crate::core::tags::{ExecutionTags, PHASE_SUB_AGENT};
use crate::core::text::{STEP_PREVIEW_CHARS, first_int, first_non_blank, preview};
use crate::core::types::{
    AttemptTrace, CODE_EXECUTION_TOOL, DecisionTrace, ExecutionContext, Params, SubAgentResult,
    SubAgentStep, TodoExecutionRecord,
};
use crate::io::config::{RefineConfig, SubAgentConfig};
use crate::io::events::{EventEmitter, EventKind};
use crate::io::llm::{ChatRequest, ModelHandle};
use crate::io::prompt::PromptEngine;
use crate::io::tools::{ToolInvoker, invoke_guarded};

use super::refinement::{CodeRefinementLoop, RefinementRequest};
use super::{compile_schema, schema_errors};

static PLAN_SCHEMA: LazyLock<Validator> =
    LazyLock::new(|| compile_schema(include_str!("../../schemas/sub_agent_plan.schema.json")));

const PLAN_STAGE: &str = "sub_agent_plan";
const STEP_STAGE: &str = "sub_agent_step_execution";
const SUMMARY_STAGE: &str = "sub_agent_summary";

const INITIAL_DATASET_KEYS: &[&str] = &[
    "dataset_ids",
    "datasetIds",
    "arg2",
    "dataset_id",
    "datasetId",
    "arg1",
];

/// Why a plan was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanErrorCategory {
    ParseError,
    SchemaValidationError,
    TooManySteps,
    ToolNotAllowed,
    LlmError,
}

impl PlanErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::SchemaValidationError => "SCHEMA_VALIDATION_ERROR",
            Self::TooManySteps => "TOO_MANY_STEPS",
            Self::ToolNotAllowed => "TOOL_NOT_ALLOWED",
            Self::LlmError => "LLM_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanError {
    pub category: PlanErrorCategory,
    pub message: String,
}

impl PlanError {
    fn new(category: PlanErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// A validated plan step.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub tool: String,
    pub args: Params,
    pub note: String,
}

/// Parse and validate a planner reply.
pub fn validate_plan(
    text: &str,
    max_steps: u32,
    whitelist: &BTreeSet<String>,
) -> Result<Vec<PlannedStep>, PlanError> {
    let root: Value = serde_json::from_str(extract_structured_payload(text)).map_err(|err| {
        PlanError::new(
            PlanErrorCategory::ParseError,
            format!("plan is not valid JSON: {err}"),
        )
    })?;
    if !root.is_object() {
        return Err(PlanError::new(
            PlanErrorCategory::ParseError,
            "plan must be a JSON object",
        ));
    }
    let errors = schema_errors(&PLAN_SCHEMA, &root);
    if !errors.is_empty() {
        return Err(PlanError::new(
            PlanErrorCategory::SchemaValidationError,
            errors.join("; "),
        ));
    }

    let steps: Vec<PlannedStep> = root["steps"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(|step| PlannedStep {
            tool: step["tool"].as_str().unwrap_or_default().trim().to_string(),
            args: step["args"].as_object().cloned().unwrap_or_default(),
            note: step["note"].as_str().unwrap_or_default().to_string(),
        })
        .collect();
    if steps.is_empty() {
        return Err(PlanError::new(
            PlanErrorCategory::SchemaValidationError,
            "plan has no steps",
        ));
    }
    let max_steps = usize::try_from(max_steps).unwrap_or(usize::MAX);
    if steps.len() > max_steps {
        return Err(PlanError::new(
            PlanErrorCategory::TooManySteps,
            format!("plan has {} steps, max is {max_steps}", steps.len()),
        ));
    }
    let mut invalid: Vec<&str> = Vec::new();
    for step in &steps {
        if !whitelist.contains(&step.tool) && !invalid.contains(&step.tool.as_str()) {
            invalid.push(&step.tool);
        }
    }
    if !invalid.is_empty() {
        return Err(PlanError::new(
            PlanErrorCategory::ToolNotAllowed,
            format!("tools not allowed: {}", invalid.join(", ")),
        ));
    }
    Ok(steps)
}

pub struct SubAgentRequest<'a> {
    pub task_id: &'a str,
    pub goal: &'a str,
    /// Serialized context handed to the planner and the code generator.
    pub context: &'a str,
    /// Resolved params of the delegating todo.
    pub seed_args: &'a Params,
    pub tool_whitelist: &'a BTreeSet<String>,
    pub max_steps: u32,
    pub tags: &'a ExecutionTags,
}

pub struct SubAgentRunner<'a> {
    tools: &'a dyn ToolInvoker,
    resolver: &'a dyn ParamResolver,
    config: &'a SubAgentConfig,
    refine: &'a RefineConfig,
    prompts: &'a PromptEngine,
    events: EventEmitter<'a>,
}

struct Plan {
    steps: Vec<PlannedStep>,
    decision: DecisionTrace,
}

impl<'a> SubAgentRunner<'a> {
    pub fn new(
        tools: &'a dyn ToolInvoker,
        resolver: &'a dyn ParamResolver,
        config: &'a SubAgentConfig,
        refine: &'a RefineConfig,
        prompts: &'a PromptEngine,
        events: EventEmitter<'a>,
    ) -> Self {
        Self {
            tools,
            resolver,
            config,
            refine,
            prompts,
            events,
        }
    }

    #[instrument(skip_all, fields(task_id = request.task_id, max_steps = request.max_steps))]
    pub fn run(&self, request: &SubAgentRequest<'_>, llm: &ModelHandle) -> SubAgentResult {
        if request.goal.trim().is_empty() {
            return SubAgentResult::failure("sub_agent goal missing", Vec::new());
        }
        let tags = request.tags.with_phase(PHASE_SUB_AGENT);

        let plan = match self.plan(request, &tags, llm) {
            Ok(plan) => plan,
            Err(err) => {
                return self.fail(request, err.message, Some(err.category.as_str()), Vec::new());
            }
        };
        self.events.emit(
            EventKind::SubAgentPlanCreated,
            json!({
                "task_id": request.task_id,
                "steps_count": plan.steps.len(),
                "steps": plan.steps.iter().enumerate().map(|(index, step)| json!({
                    "index": index,
                    "tool": step.tool,
                    "note": step.note,
                })).collect::<Vec<_>>(),
                "endpoint": llm.endpoint,
                "model": llm.model_name,
            }),
        );

        let mut executed: Vec<SubAgentStep> = Vec::new();
        for planned in &plan.steps {
            if let Err(message) = self.execute_step(request, &tags, &plan.decision, planned, &mut executed, llm) {
                return self.fail(request, message, None, executed);
            }
        }

        let steps_json = serde_json::to_string(&executed).unwrap_or_default();
        let summary = self.prompts.sub_agent_summary().and_then(|system| {
            let user = self.prompts.sub_agent_summary_user(request.goal, &steps_json)?;
            llm.generate(&ChatRequest::prompt(system, user, tags.with_stage(SUMMARY_STAGE)))
        });
        let answer = match summary {
            Ok(response) => response.text,
            Err(err) => return self.fail(request, format!("{err:#}"), None, executed),
        };
        info!(steps = executed.len(), "sub-agent completed");
        self.events.emit(
            EventKind::SubAgentCompleted,
            json!({
                "task_id": request.task_id,
                "steps": executed.len(),
                "endpoint": llm.endpoint,
                "model": llm.model_name,
            }),
        );
        SubAgentResult {
            success: true,
            answer,
            error: String::new(),
            steps: executed,
        }
    }

    fn plan(
        &self,
        request: &SubAgentRequest<'_>,
        tags: &ExecutionTags,
        llm: &ModelHandle,
    ) -> Result<Plan, PlanError> {
        let tools: Vec<String> = request.tool_whitelist.iter().cloned().collect();
        let system = self
            .prompts
            .sub_agent_planner(&tools, request.max_steps)
            .map_err(|err| PlanError::new(PlanErrorCategory::LlmError, format!("{err:#}")))?;
        let max_attempts = self.config.planning_max_attempts.max(1);
        let mut last_error = PlanError::new(
            PlanErrorCategory::SchemaValidationError,
            "sub_agent plan generation failed",
        );
        let mut retry_hint: Option<String> = None;

        for attempt in 1..=max_attempts {
            let outcome = self
                .prompts
                .sub_agent_plan_user(request.goal, request.context, retry_hint.as_deref())
                .and_then(|user| {
                    llm.generate(&ChatRequest::prompt(
                        system.clone(),
                        user,
                        tags.with_stage(PLAN_STAGE),
                    ))
                })
                .map_err(|err| PlanError::new(PlanErrorCategory::LlmError, format!("{err:#}")))
                .and_then(|response| {
                    let steps = validate_plan(&response.text, request.max_steps, request.tool_whitelist)?;
                    Ok((steps, response.trace_id.unwrap_or_default()))
                });
            match outcome {
                Ok((steps, trace_id)) => {
                    debug!(attempt, steps = steps.len(), "sub-agent plan accepted");
                    return Ok(Plan {
                        steps,
                        decision: DecisionTrace {
                            llm_trace_id: trace_id,
                            stage: PLAN_STAGE.to_string(),
                            excerpt: preview(&system, STEP_PREVIEW_CHARS),
                        },
                    });
                }
                Err(err) => {
                    warn!(attempt, category = err.category.as_str(), error = %err.message, "sub-agent plan rejected");
                    retry_hint = Some(format!(
                        "The previous plan was rejected. error_category={}, error={}. Reply with a plan that satisfies the JSON schema exactly.",
                        err.category.as_str(),
                        err.message
                    ));
                    self.events.emit(
                        EventKind::SubAgentPlanRetry,
                        json!({
                            "task_id": request.task_id,
                            "attempt": attempt,
                            "max_attempts": max_attempts,
                            "error_category": err.category.as_str(),
                            "reason": err.message,
                        }),
                    );
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    /// Run one planned step, appending it to `executed`. `Err` carries the
    /// failure message that aborts the run.
    fn execute_step(
        &self,
        request: &SubAgentRequest<'_>,
        tags: &ExecutionTags,
        decision: &DecisionTrace,
        planned: &PlannedStep,
        executed: &mut Vec<SubAgentStep>,
        llm: &ModelHandle,
    ) -> Result<(), String> {
        let tool = planned.tool.as_str();
        if !request.tool_whitelist.contains(tool) {
            return Err(format!("sub_agent tool not allowed: {tool}"));
        }
        let resolved = self.resolver.resolve(&planned.args, &self.alias_context(executed));
        let args = normalize_step_args(tool, &resolved, executed, request.seed_args);
        let unresolved = collect_unresolved(&args);
        if !unresolved.is_empty() {
            let placeholders: Vec<&str> = unresolved
                .iter()
                .map(|p| p.raw_placeholder.as_str())
                .collect();
            return Err(format!(
                "PARAM_PLACEHOLDER_UNRESOLVED: tool={tool}, placeholders=[{}]",
                placeholders.join(", ")
            ));
        }

        let step_index = executed.len();
        let step_tags = tags
            .with_stage(STEP_STAGE)
            .with_sub_agent_step(step_index)
            .with_decision(decision.clone());
        self.events.emit(
            EventKind::SubAgentStepStarted,
            json!({"task_id": request.task_id, "step_index": step_index, "tool": tool, "args": args}),
        );

        let (output, success, cache) = if tool == CODE_EXECUTION_TOOL {
            let result = CodeRefinementLoop::new(self.tools, self.refine, self.prompts).execute(
                RefinementRequest {
                    goal: request.goal,
                    context: request.context,
                    coding_context: &coding_context(&args, executed, request.context),
                    initial_code: first_non_blank(&args, &["code", "arg0"]),
                    run_args: initial_run_args(&args),
                    tags: &step_tags,
                },
                llm,
            );
            self.events.emit(
                EventKind::SubAgentPythonRefined,
                json!({
                    "task_id": request.task_id,
                    "step_index": step_index,
                    "success": result.success,
                    "attempts_used": result.attempts_used,
                    "traces": trace_summaries(&result.traces, !result.success),
                }),
            );
            (result.output, result.success, Value::Null)
        } else {
            let invocation = invoke_guarded(self.tools, tool, &args, &step_tags);
            let success = invocation.success && is_ok_payload(&invocation.output);
            let cache = serde_json::to_value(&invocation.cache).unwrap_or(Value::Null);
            (invocation.output, success, cache)
        };

        self.events.emit(
            EventKind::SubAgentStepFinished,
            json!({
                "task_id": request.task_id,
                "step_index": step_index,
                "tool": tool,
                "success": success,
                "output_preview": preview(&output, STEP_PREVIEW_CHARS),
                "cache": cache,
            }),
        );
        let reason = preview(&output, STEP_PREVIEW_CHARS);
        executed.push(SubAgentStep {
            tool: tool.to_string(),
            args,
            output,
            success,
        });
        if success {
            Ok(())
        } else {
            Err(format!("sub_agent step failed: tool={tool}, reason={reason}"))
        }
    }

    /// `step_<i>` (zero-based) and `todo_<n>` (one-based) aliases for earlier
    /// step outputs.
    fn alias_context(&self, executed: &[SubAgentStep]) -> ExecutionContext {
        let mut context = ExecutionContext::new();
        for (index, step) in executed.iter().enumerate() {
            let record = TodoExecutionRecord {
                success: step.success,
                output: step.output.clone(),
                summary: preview(&step.output, STEP_PREVIEW_CHARS),
                tool_calls_used: 1,
                ..TodoExecutionRecord::default()
            };
            if self.config.resolve_step_alias {
                context.insert(format!("step_{index}"), record.clone());
            }
            if self.config.resolve_todo_alias {
                context.insert(format!("todo_{}", index + 1), record);
            }
        }
        context
    }

    fn fail(
        &self,
        request: &SubAgentRequest<'_>,
        error: String,
        category: Option<&str>,
        steps: Vec<SubAgentStep>,
    ) -> SubAgentResult {
        warn!(task_id = request.task_id, error = %error, "sub-agent failed");
        let mut payload = json!({"task_id": request.task_id, "error": error});
        if let Some(category) = category {
            payload["error_category"] = json!(category);
        }
        self.events.emit(EventKind::SubAgentFailed, payload);
        SubAgentResult::failure(error, steps)
    }
}

/// Model-selected context (or the task context) plus dataset hints from
/// earlier step outputs.
fn coding_context(args: &Params, executed: &[SubAgentStep], fallback: &str) -> String {
    let mut out = String::new();
    let selected = first_non_blank(args, CODING_CONTEXT_KEYS);
    if !selected.is_empty() {
        out.push_str("Model-selected context:\n");
        out.push_str(selected.trim());
        out.push('\n');
    } else if !fallback.trim().is_empty() {
        out.push_str("Task context:\n");
        out.push_str(fallback.trim());
        out.push('\n');
    }
    let hints = dataset_hints(executed);
    if !hints.trim().is_empty() {
        out.push_str("Dataset hints from recent tool outputs:\n");
        out.push_str(&hints);
    }
    out.trim().to_string()
}

/// Baseline run args of a code-execution step.
fn initial_run_args(args: &Params) -> Params {
    let mut run_args = args
        .get("run_args")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let ids = first_non_blank(args, INITIAL_DATASET_KEYS);
    if !ids.is_empty() {
        run_args.insert("dataset_ids".to_string(), Value::String(ids));
    }
    let libraries = first_non_blank(args, &["libraries", "arg3"]);
    if !libraries.is_empty() {
        run_args.insert("libraries".to_string(), Value::String(libraries));
    }
    if let Some(timeout) = first_int(args, &["timeout_seconds", "timeoutSeconds", "arg4"]) {
        if timeout > 0 {
            run_args.insert("timeout_seconds".to_string(), json!(timeout));
        }
    }
    run_args
}

fn trace_summaries(traces: &[AttemptTrace], include_snapshot: bool) -> Vec<Value> {
    traces
        .iter()
        .map(|trace| {
            let mut summary = json!({
                "attempt": trace.attempt,
                "success": trace.success,
                "code": trace.code,
                "run_args": trace.run_args,
                "output_preview": preview(&trace.output, STEP_PREVIEW_CHARS),
            });
            if include_snapshot && !trace.llm_snapshot.is_empty() {
                summary["llm_snapshot"] = Value::Object(trace.llm_snapshot.clone());
            }
            summary
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::placeholder::TemplateParamResolver;
    use crate::io::config::WorkflowConfig;
    use crate::test_support::{
        RecordingEventSink, ScriptedChatModel, ScriptedToolInvoker, model_handle,
    };

    const SEARCH_OK: &str = r#"{"ok":true,"data":{"items":[{"ts_code":"000300.SH"}]}}"#;
    const DAILY_OK: &str =
        r#"{"ok":true,"data":{"dataset_id":"ds_300","ts_code":"000300.SH","rows":242}}"#;
    const PYTHON_OK: &str = r#"{"ok":true,"data":{"mean":0.12}}"#;

    fn whitelist() -> BTreeSet<String> {
        ["searchIndex", "getIndexDaily", "executePython"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    struct Fixture {
        tools: ScriptedToolInvoker,
        sink: RecordingEventSink,
        config: WorkflowConfig,
        prompts: PromptEngine,
        whitelist: BTreeSet<String>,
    }

    impl Fixture {
        fn new(tools: ScriptedToolInvoker) -> Self {
            Self {
                tools,
                sink: RecordingEventSink::default(),
                config: WorkflowConfig::default(),
                prompts: PromptEngine::new(),
                whitelist: whitelist(),
            }
        }

        fn run(&self, goal: &str, max_steps: u32, model: &Arc<ScriptedChatModel>) -> SubAgentResult {
            let seed = Params::new();
            let tags = ExecutionTags::for_run("run-1", "user-1");
            let runner = SubAgentRunner::new(
                &self.tools,
                &TemplateParamResolver,
                &self.config.sub_agent,
                &self.config.code_refine,
                &self.prompts,
                EventEmitter::new(&self.sink, "run-1", "user-1"),
            );
            runner.run(
                &SubAgentRequest {
                    task_id: "t1",
                    goal,
                    context: "{}",
                    seed_args: &seed,
                    tool_whitelist: &self.whitelist,
                    max_steps,
                    tags: &tags,
                },
                &model_handle(model),
            )
        }
    }

    #[test]
    fn plan_validation_categories() {
        let tools = whitelist();
        let reject = |text: &str, max: u32| validate_plan(text, max, &tools).unwrap_err().category;

        assert_eq!(reject("no json here", 3), PlanErrorCategory::ParseError);
        assert_eq!(reject("[1, 2]", 3), PlanErrorCategory::ParseError);
        assert_eq!(reject(r#"{"steps": "x"}"#, 3), PlanErrorCategory::SchemaValidationError);
        assert_eq!(reject(r#"{"steps": []}"#, 3), PlanErrorCategory::SchemaValidationError);
        assert_eq!(
            reject(r#"{"steps": [{"tool": "searchIndex"}, {"tool": "searchIndex"}]}"#, 1),
            PlanErrorCategory::TooManySteps
        );
        let err = validate_plan(r#"{"steps": [{"tool": "deleteAll"}]}"#, 3, &tools).unwrap_err();
        assert_eq!(err.category, PlanErrorCategory::ToolNotAllowed);
        assert_eq!(err.message, "tools not allowed: deleteAll");

        let steps = validate_plan(
            r#"{"analysis": "a", "steps": [{"tool": "searchIndex", "args": {"keyword": "csi"}, "note": "find"}]}"#,
            3,
            &tools,
        )
        .expect("valid plan");
        assert_eq!(steps[0].args["keyword"], json!("csi"));
        assert_eq!(steps[0].note, "find");
    }

    #[test]
    fn blank_goal_fails_without_model_calls() {
        let fixture = Fixture::new(ScriptedToolInvoker::new());
        let model = Arc::new(ScriptedChatModel::default());

        let result = fixture.run("  ", 3, &model);

        assert!(!result.success);
        assert_eq!(result.error, "sub_agent goal missing");
        assert_eq!(model.calls(), 0);
    }

    /// Verifies a plan referencing an earlier step resolves through the step
    /// alias and the summary becomes the answer.
    #[test]
    fn steps_resolve_earlier_outputs_and_summarize() {
        let fixture = Fixture::new(
            ScriptedToolInvoker::new()
                .always("searchIndex", SEARCH_OK)
                .always("getIndexDaily", DAILY_OK),
        );
        let model = Arc::new(ScriptedChatModel::new([
            r#"{"analysis": "find then fetch", "steps": [
                {"tool": "searchIndex", "args": {"query": "CSI 300"}, "note": "find code"},
                {"tool": "getIndexDaily", "args": {"ts_code": "${step_0.data.items[0].ts_code}", "start_date": "2024-01-01", "end_date": "2024-12-31"}, "note": "fetch"}
            ]}"#,
            "CSI 300 data fetched as ds_300",
        ]));

        let result = fixture.run("fetch CSI 300 daily data", 3, &model);

        assert!(result.success, "{}", result.error);
        assert_eq!(result.answer, "CSI 300 data fetched as ds_300");
        assert_eq!(result.steps.len(), 2);
        let calls = fixture.tools.calls();
        assert_eq!(calls[0].args["keyword"], json!("CSI 300"));
        assert_eq!(calls[1].args["tsCode"], json!("000300.SH"));
        assert_eq!(calls[1].args["startDateStr"], json!("20240101"));
        assert_eq!(calls[1].tags.sub_agent_step, Some(1));
        assert_eq!(
            calls[1].tags.decision.as_ref().map(|d| d.stage.as_str()),
            Some(PLAN_STAGE)
        );
        assert_eq!(
            fixture.sink.kinds(),
            vec![
                "SUB_AGENT_PLAN_CREATED",
                "SUB_AGENT_STEP_STARTED",
                "SUB_AGENT_STEP_FINISHED",
                "SUB_AGENT_STEP_STARTED",
                "SUB_AGENT_STEP_FINISHED",
                "SUB_AGENT_COMPLETED",
            ]
        );
    }

    #[test]
    fn invalid_plans_are_retried_with_hint() {
        let fixture = Fixture::new(ScriptedToolInvoker::new().always("searchIndex", SEARCH_OK));
        let model = Arc::new(ScriptedChatModel::new([
            r#"{"steps": [{"tool": "deleteAll"}]}"#,
            r#"{"steps": [{"tool": "searchIndex", "args": {"keyword": "csi"}}]}"#,
            "done",
        ]));

        let result = fixture.run("search", 3, &model);

        assert!(result.success);
        let retry = fixture.sink.payloads("SUB_AGENT_PLAN_RETRY");
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0]["error_category"], json!("TOOL_NOT_ALLOWED"));
        assert!(model.requests()[1].user_text().contains("error_category=TOOL_NOT_ALLOWED"));
        assert!(!model.requests()[0].user_text().contains("error_category="));
    }

    #[test]
    fn exhausted_planning_fails_with_last_error() {
        let fixture = Fixture::new(ScriptedToolInvoker::new());
        let model = Arc::new(ScriptedChatModel::new(["nope", "nope"]));
        model.push_error("provider down");

        let result = fixture.run("search", 3, &model);

        assert!(!result.success);
        assert!(result.steps.is_empty());
        assert_eq!(result.error, "provider down");
        assert_eq!(fixture.sink.count("SUB_AGENT_PLAN_RETRY"), 3);
        let failed = fixture.sink.payloads("SUB_AGENT_FAILED");
        assert_eq!(failed[0]["error_category"], json!("LLM_ERROR"));
    }

    #[test]
    fn unresolved_placeholder_aborts_before_any_call() {
        let fixture = Fixture::new(ScriptedToolInvoker::new().always("searchIndex", SEARCH_OK));
        let model = Arc::new(ScriptedChatModel::new([
            r#"{"steps": [{"tool": "searchIndex", "args": {"keyword": "${step_4.output}"}}]}"#,
        ]));

        let result = fixture.run("search", 3, &model);

        assert!(!result.success);
        assert_eq!(
            result.error,
            "PARAM_PLACEHOLDER_UNRESOLVED: tool=searchIndex, placeholders=[${step_4.output}]"
        );
        assert!(fixture.tools.calls().is_empty());
    }

    #[test]
    fn failing_step_aborts_with_preview() {
        let fixture = Fixture::new(
            ScriptedToolInvoker::new().always("searchIndex", r#"{"ok":false,"error":"bad keyword"}"#),
        );
        let model = Arc::new(ScriptedChatModel::new([
            r#"{"steps": [{"tool": "searchIndex", "args": {"keyword": "x"}}, {"tool": "searchIndex", "args": {"keyword": "y"}}]}"#,
        ]));

        let result = fixture.run("search", 3, &model);

        assert!(!result.success);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(
            result.error,
            r#"sub_agent step failed: tool=searchIndex, reason={"ok":false,"error":"bad keyword"}"#
        );
        assert_eq!(fixture.tools.call_count("searchIndex"), 1);
    }

    /// Verifies code steps go through refinement with dataset ids discovered
    /// from earlier outputs.
    #[test]
    fn code_steps_use_refinement_with_discovered_datasets() {
        let fixture = Fixture::new(
            ScriptedToolInvoker::new()
                .always("getIndexDaily", DAILY_OK)
                .always(CODE_EXECUTION_TOOL, PYTHON_OK),
        );
        let model = Arc::new(ScriptedChatModel::new([
            r#"{"steps": [
                {"tool": "getIndexDaily", "args": {"tsCode": "000300.SH"}},
                {"tool": "executePython", "args": {"coding_context": "daily closes"}}
            ]}"#,
            r#"{"code": "print(1)"}"#,
            "mean return is 0.12",
        ]));

        let result = fixture.run("mean return", 3, &model);

        assert!(result.success, "{}", result.error);
        let python = fixture
            .tools
            .calls()
            .into_iter()
            .find(|call| call.tool == CODE_EXECUTION_TOOL)
            .expect("python call");
        assert_eq!(python.args["dataset_ids"], json!("ds_300"));
        assert_eq!(python.args["code"], json!("print(1)"));
        let generation = model.requests()[1].user_text().to_string();
        assert!(generation.contains("Model-selected context:\ndaily closes"));
        assert!(generation.contains("- dataset_id=ds_300"));
        let refined = fixture.sink.payloads("SUB_AGENT_PYTHON_REFINED");
        assert_eq!(refined[0]["attempts_used"], json!(1));
        assert_eq!(refined[0]["step_index"], json!(1));
    }
}
