//! Linear execution of a planned todo list.
//!
//! Items run strictly in plan order. After every item the checkpoint is
//! rewritten, so an interrupted run resumes at the first unprocessed item
//! without repeating finished ones. A failed item never aborts the run unless
//! `fail_fast` is set; the final answer is synthesized over whatever was
//! processed.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::agents::judge::{JudgeRequest, SemanticJudge};
use crate::agents::recovery::{RecoveryAgent, RecoveryRequest};
use crate::agents::sub_agent::{SubAgentRequest, SubAgentRunner};
use crate::agents::synthesis::{SynthesisRequest, synthesize_final_answer};
use crate::core::budget::{RecoveryBudget, RetryDecision, ToolCallCounter};
use crate::core::classifier::{Dispatch, classify_dispatch, resolve_failure_category};
use crate::core::invariants::{duplicate_ids, validate_checkpoint};
use crate::core::payload::is_ok_payload;
use crate::core::placeholder::{ParamResolver, collect_unresolved};
use crate::core::precheck::StaticPrecheck;
use crate::core::run_args::sanitize_run_args;
use crate::core::tags::{ExecutionTags, PHASE_TOOL_EXECUTION};
use crate::core::text::{RESULT_PREVIEW_CHARS, first_non_blank, preview};
use crate::core::types::{
    CODE_EXECUTION_TOOL, ExecutionContext, Params, TodoExecutionRecord, TodoFailureCategory,
    TodoItem, TodoStatus, WorkflowExecutionResult, WorkflowState,
};
use crate::io::config::{ConfigLayer, WorkflowConfig};
use crate::io::events::{EventEmitter, EventKind, EventSink, RunControl};
use crate::io::llm::{ModelHandle, ModelProvider};
use crate::io::prompt::PromptEngine;
use crate::io::state_store::StateStore;
use crate::io::tools::{ToolInvoker, ToolSpec, invoke_guarded};

const TOOL_STAGE: &str = "workflow_tool_execution";
const SUB_AGENT_DISABLED: &str = "sub_agent_disabled";
const TOOL_CALL_LIMIT_REACHED: &str = "tool_call_limit_reached";

/// Code-execution calls may pass code and dataset ids positionally.
const CODE_KEYS: &[&str] = &["code", "arg0"];
const TOOL_DATASET_ID_KEYS: &[&str] = &["dataset_ids", "datasetIds", "dataset_id", "datasetId", "arg1"];

/// One run to execute (or resume).
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub run_id: String,
    pub user_id: String,
    pub user_goal: String,
    pub plan: Vec<TodoItem>,
    /// The run's primary model.
    pub model: ModelHandle,
    /// Tools available to the run; their names form the sub-agent whitelist.
    pub tool_specs: Vec<ToolSpec>,
    /// Compressed prior dialogue, forwarded to final-answer synthesis.
    pub dialogue_context: Option<String>,
}

/// External collaborators of the executor.
#[derive(Clone)]
pub struct WorkflowServices {
    pub state_store: Arc<dyn StateStore>,
    pub tools: Arc<dyn ToolInvoker>,
    pub events: Arc<dyn EventSink>,
    pub run_control: Arc<dyn RunControl>,
    pub resolver: Arc<dyn ParamResolver>,
    pub precheck: Arc<dyn StaticPrecheck>,
    pub judge: Arc<dyn SemanticJudge>,
    pub models: Arc<dyn ModelProvider>,
}

pub struct LinearWorkflowExecutor {
    services: WorkflowServices,
    local_config: ConfigLayer,
    base_config: ConfigLayer,
    prompts: PromptEngine,
}

impl LinearWorkflowExecutor {
    /// `local_config` overrides `base_config` field by field; both are
    /// resolved again at the start of every run.
    pub fn new(services: WorkflowServices, local_config: ConfigLayer, base_config: ConfigLayer) -> Self {
        Self {
            services,
            local_config,
            base_config,
            prompts: PromptEngine::new(),
        }
    }

    /// Execute `request.plan` from its checkpoint (or from the start).
    ///
    /// Item failures are reported in the result. `Err` is reserved for
    /// checkpoint storage errors, a checkpoint that does not match the plan,
    /// duplicate todo ids, and a failed final-answer call
    /// ([`crate::agents::synthesis::FinalAnswerError`]); in the last case the
    /// checkpoint is kept so executing the run again only repeats synthesis.
    #[instrument(skip_all, fields(run_id = %request.run_id, items = request.plan.len()))]
    pub fn execute(&self, request: &WorkflowRequest) -> Result<WorkflowExecutionResult> {
        let duplicates = duplicate_ids(&request.plan);
        if !duplicates.is_empty() {
            bail!("plan has duplicate todo ids: {}", duplicates.join(", "));
        }
        let config = WorkflowConfig::resolve(&self.local_config, &self.base_config);
        let store = self.services.state_store.as_ref();

        let mut state = match store
            .load_workflow_state(&request.run_id)
            .with_context(|| format!("load checkpoint for run {}", request.run_id))?
        {
            Some(state) => {
                let errors = validate_checkpoint(&request.plan, &state);
                if !errors.is_empty() {
                    bail!(
                        "checkpoint for run {} does not match the plan:\n- {}",
                        request.run_id,
                        errors.join("\n- ")
                    );
                }
                info!(index = state.current_index, tool_calls_used = state.tool_calls_used, "resuming run");
                state
            }
            None => WorkflowState {
                current_index: 0,
                completed_items: Vec::new(),
                context: ExecutionContext::new(),
                tool_calls_used: 0,
                saved_at: Utc::now(),
            },
        };

        let run = RunScope {
            executor: self,
            request,
            events: EventEmitter::new(self.services.events.as_ref(), &request.run_id, &request.user_id),
            tags: ExecutionTags::for_run(&request.run_id, &request.user_id),
            counter: ToolCallCounter::new(config.execution.max_tool_calls, state.tool_calls_used),
            config,
        };

        let mut failed: Vec<String> = state
            .completed_items
            .iter()
            .filter(|item| item.status == TodoStatus::Failed)
            .map(|item| item.id.clone())
            .collect();
        // A resumed fail-fast run that already recorded a failure goes
        // straight to synthesis.
        let mut stopped_at: Option<String> = if run.config.execution.fail_fast {
            failed.first().cloned()
        } else {
            None
        };

        let start = state.current_index;
        for (index, planned) in request.plan.iter().enumerate().skip(start) {
            if stopped_at.is_some() {
                break;
            }
            if !self
                .services
                .run_control
                .is_runnable(&request.run_id, &request.user_id)
            {
                run.save(&mut state)?;
                run.events.emit(
                    EventKind::WorkflowPaused,
                    json!({"current_index": index, "tool_calls_used": run.counter.used()}),
                );
                info!(index, "run paused");
                return Ok(WorkflowExecutionResult {
                    paused: true,
                    success: false,
                    failure_reason: None,
                    final_answer: None,
                    completed_items: state.completed_items,
                    context: state.context,
                    tool_calls_used: run.counter.used(),
                });
            }

            let mut item = planned.clone();
            let record = match classify_dispatch(&item, run.config.execution.default_execution_mode) {
                Dispatch::Thought => {
                    run.mark_started(&mut item, None);
                    TodoExecutionRecord::succeeded(item.reasoning.clone(), item.reasoning.clone(), 0)
                }
                Dispatch::SubAgent => {
                    run.mark_started(&mut item, None);
                    run.execute_sub_agent(&item, &state.context)
                }
                Dispatch::ToolCall => run.execute_with_recovery(&mut item, &state.context),
            };

            item.status = if record.success {
                TodoStatus::Completed
            } else {
                TodoStatus::Failed
            };
            item.completed_at = Some(Utc::now());
            item.result_summary = Some(record.summary.clone());
            item.output = Some(record.output.clone());
            let kind = if record.success {
                EventKind::TodoFinished
            } else {
                EventKind::TodoFailed
            };
            let payload = json!({
                "todo_id": item.id,
                "success": record.success,
                "summary": record.summary,
                "output_preview": preview(&record.output, RESULT_PREVIEW_CHARS),
                "tool_calls_used": run.counter.used(),
            });
            let success = record.success;
            let id = item.id.clone();
            state.context.insert(id.clone(), record);
            state.completed_items.push(item);
            state.current_index = index + 1;
            run.save(&mut state)?;
            run.events.emit(kind, payload);

            if success {
                debug!(todo_id = %id, "todo completed");
            } else {
                warn!(todo_id = %id, "todo failed");
                failed.push(id.clone());
                if run.config.execution.fail_fast {
                    stopped_at = Some(id);
                }
            }
        }

        let answer = synthesize_final_answer(
            &self.prompts,
            &SynthesisRequest {
                user_goal: &request.user_goal,
                dialogue_context: request.dialogue_context.as_deref(),
                items: &state.completed_items,
                context: &state.context,
                tags: &run.tags,
            },
            &request.model,
            &run.events,
        )?;
        store
            .clear_workflow_state(&request.run_id)
            .with_context(|| format!("clear checkpoint for run {}", request.run_id))?;

        let failure_reason = match (&stopped_at, failed.is_empty()) {
            (Some(id), _) => Some(format!("todo_failed:{id}")),
            (None, false) => Some("todo_partial_failed".to_string()),
            (None, true) => None,
        };
        info!(
            processed = state.completed_items.len(),
            failed = failed.len(),
            tool_calls_used = run.counter.used(),
            "run finished"
        );
        Ok(WorkflowExecutionResult {
            paused: false,
            success: failure_reason.is_none(),
            failure_reason,
            final_answer: Some(answer),
            completed_items: state.completed_items,
            context: state.context,
            tool_calls_used: run.counter.used(),
        })
    }
}

/// Everything fixed for the duration of one `execute` call.
struct RunScope<'a> {
    executor: &'a LinearWorkflowExecutor,
    request: &'a WorkflowRequest,
    config: WorkflowConfig,
    events: EventEmitter<'a>,
    tags: ExecutionTags,
    counter: ToolCallCounter,
}

impl RunScope<'_> {
    fn services(&self) -> &WorkflowServices {
        &self.executor.services
    }

    fn save(&self, state: &mut WorkflowState) -> Result<()> {
        state.tool_calls_used = self.counter.used();
        state.saved_at = Utc::now();
        self.services()
            .state_store
            .save_workflow_state(&self.request.run_id, state)
            .with_context(|| {
                format!(
                    "save checkpoint for run {} at index {}",
                    self.request.run_id, state.current_index
                )
            })
    }

    /// Stamp an item RUNNING and announce it. Only tool-call attempts carry
    /// an attempt number.
    fn mark_started(&self, item: &mut TodoItem, attempt: Option<u32>) {
        item.status = TodoStatus::Running;
        let mut payload = json!({
            "todo_id": item.id,
            "sequence": item.sequence,
            "type": item.kind(),
            "tool": item.tool_name(),
        });
        if let Some(attempt) = attempt {
            payload["attempt"] = json!(attempt);
        }
        self.events.emit(EventKind::TodoStarted, payload);
    }

    /// Run a tool-call item, asking for recovery params after each failure
    /// until a budget runs out or recovery gives up.
    fn execute_with_recovery(
        &self,
        item: &mut TodoItem,
        context: &ExecutionContext,
    ) -> TodoExecutionRecord {
        let mut budget = RecoveryBudget::new(self.config.execution.recovery_limits());
        loop {
            self.mark_started(item, Some(budget.attempts + 1));
            let record = self.execute_tool(item, context);
            if record.success {
                return record;
            }

            let category = resolve_failure_category(&record);
            let decision = budget.after_failure(category, self.counter.is_exhausted());
            if decision != RetryDecision::Retry {
                debug!(todo_id = %item.id, category = category.as_str(), reason = decision.as_str(), "no further recovery");
                return record;
            }

            let tags = self.tags.with_todo(item);
            let recovery = RecoveryAgent::new(
                self.services().models.as_ref(),
                self.config.execution.static_fix.as_ref(),
                &self.executor.prompts,
            )
            .recover(
                &RecoveryRequest {
                    user_goal: &self.request.user_goal,
                    todo: item,
                    record: &record,
                    category,
                    context,
                    tags: &tags,
                },
                &self.request.model,
                &self.events,
            );
            let Some(plan) = recovery else {
                return record;
            };
            item.replace_params(plan.params);
            item.decision = Some(plan.decision);
            budget.charge(category);
            info!(todo_id = %item.id, attempt = budget.attempts, category = category.as_str(), "retrying with recovered params");
            self.events.emit(
                EventKind::TodoRetry,
                json!({
                    "todo_id": item.id,
                    "attempt": budget.attempts,
                    "tool_calls_used": self.counter.used(),
                    "failure_category": category.as_str(),
                    "static_recovery_attempts": budget.static_recoveries,
                    "runtime_recovery_attempts": budget.runtime_recoveries,
                    "semantic_recovery_attempts": budget.semantic_recoveries,
                    "total_recovery_attempts": budget.total_recoveries,
                }),
            );
        }
    }

    /// One attempt of a tool-call item.
    fn execute_tool(&self, item: &TodoItem, context: &ExecutionContext) -> TodoExecutionRecord {
        let tool = item.tool_name();
        if self.counter.is_exhausted() {
            self.events.emit(
                EventKind::ToolCallLimitReached,
                json!({"limit": self.counter.limit(), "used": self.counter.used()}),
            );
            return TodoExecutionRecord::failed(TOOL_CALL_LIMIT_REACHED, 0);
        }

        let raw = item.action.params().cloned().unwrap_or_default();
        let params = self.services().resolver.resolve(&raw, context);
        let unresolved = collect_unresolved(&params);
        if let Some(first) = unresolved.first() {
            self.events.emit(
                EventKind::ToolCallPlaceholderUnresolved,
                json!({
                    "todo_id": item.id,
                    "tool_name": tool,
                    "error_category": "PARAM_PLACEHOLDER_UNRESOLVED",
                    "unresolved_placeholders": unresolved,
                }),
            );
            return TodoExecutionRecord::failed(
                format!(
                    "PARAM_PLACEHOLDER_UNRESOLVED: tool={tool}, param={}, placeholder={}",
                    first.param_key, first.raw_placeholder
                ),
                0,
            );
        }

        self.events.emit(
            EventKind::ToolCallStarted,
            json!({"todo_id": item.id, "tool_name": tool, "parameters": params}),
        );
        let is_code = tool == CODE_EXECUTION_TOOL;
        let code = first_non_blank(&params, CODE_KEYS);
        let run_args = sanitize_run_args(&params);

        if is_code && self.config.execution.static_precheck_enabled {
            let dataset_ids = first_non_blank(&params, TOOL_DATASET_ID_KEYS);
            let outcome = self.services().precheck.check(&code, &dataset_ids, &run_args);
            if !outcome.passed {
                let summary = outcome.summary();
                self.events.emit(
                    EventKind::ToolCallStaticPrecheckFailed,
                    json!({
                        "todo_id": item.id,
                        "tool_name": tool,
                        "error_category": TodoFailureCategory::Static.as_str(),
                        "summary": summary,
                        "report": outcome.report,
                    }),
                );
                return TodoExecutionRecord {
                    failure_category: Some(TodoFailureCategory::Static),
                    precheck_report: Some(outcome.report),
                    ..TodoExecutionRecord::failed(summary, 0)
                };
            }
        }

        let tags = self
            .tags
            .with_todo(item)
            .with_phase(PHASE_TOOL_EXECUTION)
            .with_stage(TOOL_STAGE);
        let invocation = invoke_guarded(self.services().tools.as_ref(), tool, &params, &tags);
        self.counter.charge(1);
        let success = invocation.success && is_ok_payload(&invocation.output);
        self.events.emit(
            EventKind::ToolCallFinished,
            json!({
                "todo_id": item.id,
                "tool_name": tool,
                "success": success,
                "cache_hit": invocation.cache_hit(),
                "result_preview": preview(&invocation.output, RESULT_PREVIEW_CHARS),
                "cache": invocation.cache,
            }),
        );
        let summary = preview(&invocation.output, RESULT_PREVIEW_CHARS);
        if !success {
            return TodoExecutionRecord {
                output: invocation.output,
                failure_category: Some(TodoFailureCategory::Runtime),
                ..TodoExecutionRecord::failed(summary, 1)
            };
        }
        let record = TodoExecutionRecord::succeeded(invocation.output, summary, 1);
        if is_code && self.config.judge.enabled {
            return self.judge(item, &run_args, &code, record, &tags);
        }
        record
    }

    fn judge(
        &self,
        item: &TodoItem,
        run_args: &Params,
        code: &str,
        record: TodoExecutionRecord,
        tags: &ExecutionTags,
    ) -> TodoExecutionRecord {
        let outcome = self.services().judge.judge(&JudgeRequest {
            user_goal: &self.request.user_goal,
            todo: item,
            run_args,
            code,
            tool_output: &record.output,
            config: &self.config.judge,
            primary: &self.request.model,
            tags,
        });
        if outcome.passed {
            return TodoExecutionRecord {
                semantic_judge_report: Some(outcome.report),
                ..record
            };
        }
        self.events.emit(
            EventKind::SemanticJudgeRejected,
            json!({
                "todo_id": item.id,
                "category": outcome.category.as_str(),
                "severity": outcome.severity.as_str(),
                "reason_cn": outcome.reason_cn,
            }),
        );
        TodoExecutionRecord {
            success: false,
            summary: outcome.rejection_summary(),
            failure_category: Some(TodoFailureCategory::Semantic),
            semantic_judge_report: Some(outcome.report),
            ..record
        }
    }

    /// Delegate an item to the sub-agent runner. Executed once, no recovery.
    fn execute_sub_agent(&self, item: &TodoItem, context: &ExecutionContext) -> TodoExecutionRecord {
        if !self.config.sub_agent.enabled {
            return TodoExecutionRecord::failed(SUB_AGENT_DISABLED, 0);
        }
        let raw = item.action.params().cloned().unwrap_or_default();
        let seed_args = self.services().resolver.resolve(&raw, context);
        let whitelist: BTreeSet<String> = self
            .request
            .tool_specs
            .iter()
            .map(|spec| spec.name.clone())
            .collect();
        let goal = if item.reasoning.trim().is_empty() {
            format!("请完成任务: {}", item.id)
        } else {
            item.reasoning.trim().to_string()
        };
        let task_context = json!({
            "user_goal": self.request.user_goal,
            "todo_id": item.id,
            "tool": item.tool_name(),
            "params": seed_args,
            "prior_results": context,
        })
        .to_string();

        self.events.emit(
            EventKind::SubAgentStarted,
            json!({"todo_id": item.id, "goal": goal}),
        );
        let tags = self.tags.with_todo(item);
        let runner = SubAgentRunner::new(
            self.services().tools.as_ref(),
            self.services().resolver.as_ref(),
            &self.config.sub_agent,
            &self.config.code_refine,
            &self.executor.prompts,
            self.events,
        );
        let result = runner.run(
            &SubAgentRequest {
                task_id: &item.id,
                goal: &goal,
                context: &task_context,
                seed_args: &seed_args,
                tool_whitelist: &whitelist,
                max_steps: self
                    .config
                    .execution
                    .sub_agent_step_budget(&self.config.sub_agent),
                tags: &tags,
            },
            &self.request.model,
        );
        let steps = u32::try_from(result.steps.len()).unwrap_or(u32::MAX);
        let calls = steps.max(1);
        self.counter.charge(calls);
        self.events.emit(
            EventKind::SubAgentFinished,
            json!({
                "todo_id": item.id,
                "success": result.success,
                "tool_calls_used": calls,
                "summary": preview(&result.answer, RESULT_PREVIEW_CHARS),
            }),
        );
        if result.success {
            let summary = preview(&result.answer, RESULT_PREVIEW_CHARS);
            TodoExecutionRecord::succeeded(result.answer, summary, calls)
        } else {
            TodoExecutionRecord {
                output: result.error.clone(),
                ..TodoExecutionRecord::failed(result.error, calls)
            }
        }
    }
}
