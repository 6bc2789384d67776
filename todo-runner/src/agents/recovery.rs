//! Recovery requests for failed tool calls.

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::core::payload::parse_json_object;
use crate::core::tags::{ExecutionTags, PHASE_RECOVERY};
use crate::core::text::{RESULT_PREVIEW_CHARS, preview};
use crate::core::types::{
    DecisionTrace, ExecutionContext, Params, TodoExecutionRecord, TodoFailureCategory, TodoItem,
};
use crate::io::config::ModelRoute;
use crate::io::events::{EventEmitter, EventKind};
use crate::io::llm::{ChatRequest, ModelHandle, ModelProvider};
use crate::io::prompt::PromptEngine;

pub const RECOVERY_STAGE: &str = "workflow_todo_recovery";

pub struct RecoveryRequest<'a> {
    pub user_goal: &'a str,
    pub todo: &'a TodoItem,
    pub record: &'a TodoExecutionRecord,
    pub category: TodoFailureCategory,
    pub context: &'a ExecutionContext,
    pub tags: &'a ExecutionTags,
}

/// Replacement params plus the decision trace of the call that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPlan {
    pub params: Params,
    pub decision: DecisionTrace,
}

struct RecoveryModel {
    handle: ModelHandle,
    static_fix: bool,
}

pub struct RecoveryAgent<'a> {
    models: &'a dyn ModelProvider,
    static_fix: Option<&'a ModelRoute>,
    prompts: &'a PromptEngine,
}

impl<'a> RecoveryAgent<'a> {
    pub fn new(
        models: &'a dyn ModelProvider,
        static_fix: Option<&'a ModelRoute>,
        prompts: &'a PromptEngine,
    ) -> Self {
        Self {
            models,
            static_fix,
            prompts,
        }
    }

    /// STATIC failures go to the static-fix model when one is configured and
    /// resolves; everything else uses the run's model.
    fn select_model(&self, category: TodoFailureCategory, primary: &ModelHandle) -> RecoveryModel {
        if category == TodoFailureCategory::Static {
            if let Some(route) = self.static_fix {
                match self
                    .models
                    .resolve(&route.endpoint, &route.model, route.temperature)
                {
                    Ok(model) => {
                        return RecoveryModel {
                            handle: ModelHandle {
                                model,
                                endpoint: route.endpoint.clone(),
                                model_name: route.model.clone(),
                            },
                            static_fix: true,
                        };
                    }
                    Err(err) => warn!(
                        endpoint = %route.endpoint,
                        model = %route.model,
                        error = %format!("{err:#}"),
                        "static fix model unavailable, using run model"
                    ),
                }
            }
        }
        RecoveryModel {
            handle: primary.clone(),
            static_fix: false,
        }
    }

    /// Ask a model for replacement params. `None` ends the retry loop: the
    /// model abandoned, the reply was unusable, or the call failed.
    pub fn recover(
        &self,
        request: &RecoveryRequest<'_>,
        primary: &ModelHandle,
        events: &EventEmitter<'_>,
    ) -> Option<RecoveryPlan> {
        let todo = request.todo;
        let category = request.category.as_str();
        events.emit(
            EventKind::TodoRecoveryStarted,
            json!({
                "todo_id": todo.id,
                "tool": todo.tool_name(),
                "error_preview": preview(&request.record.summary, RESULT_PREVIEW_CHARS),
                "error_category": category,
            }),
        );

        let payload = json!({
            "user_goal": request.user_goal,
            "failed_todo": {
                "id": todo.id,
                "tool": todo.tool_name(),
                "params": todo.action.params().cloned().unwrap_or_default(),
                "reasoning": todo.reasoning,
                "error": request.record.summary,
                "error_category": category,
                "precheck_report": request.record.precheck_report.clone().unwrap_or_else(|| json!({})),
                "semantic_judge_report": request.record.semantic_judge_report.clone().unwrap_or_else(|| json!({})),
            },
            "context": request.context,
        });
        let system = match self.prompts.recovery_system() {
            Ok(system) => system,
            Err(err) => {
                warn!(todo_id = %todo.id, error = %format!("{err:#}"), "recovery prompt failed");
                return None;
            }
        };
        let selected = self.select_model(request.category, primary);
        let tags = request.tags.with_phase(PHASE_RECOVERY).with_stage(RECOVERY_STAGE);
        let chat = ChatRequest::prompt(
            system,
            serde_json::to_string(&payload).unwrap_or_default(),
            tags,
        );

        let response = match selected.handle.generate(&chat) {
            Ok(response) => response,
            Err(err) => {
                warn!(todo_id = %todo.id, error = %format!("{err:#}"), "recovery call failed");
                return None;
            }
        };
        events.emit(
            EventKind::TodoRecoveryCompleted,
            json!({
                "todo_id": todo.id,
                "response_preview": preview(&response.text, RESULT_PREVIEW_CHARS),
                "error_category": category,
                "recovery_model": selected.handle.model_name,
                "recovery_endpoint": selected.handle.endpoint,
                "using_static_fix_model": selected.static_fix,
            }),
        );

        let Some(parsed) = parse_json_object(&response.text) else {
            debug!(todo_id = %todo.id, "recovery reply is not a JSON object");
            return None;
        };
        if parsed.get("abandon").and_then(Value::as_bool) == Some(true) {
            debug!(todo_id = %todo.id, "recovery abandoned");
            return None;
        }
        let params = match parsed.get("params") {
            Some(Value::Object(params)) if !params.is_empty() => params.clone(),
            _ => {
                debug!(todo_id = %todo.id, "recovery reply has no params");
                return None;
            }
        };
        Some(RecoveryPlan {
            params,
            decision: DecisionTrace {
                llm_trace_id: response.trace_id.unwrap_or_default(),
                stage: RECOVERY_STAGE.to_string(),
                excerpt: preview(&response.text, RESULT_PREVIEW_CHARS),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_support::{
        RecordingEventSink, ScriptedChatModel, StaticModelProvider, model_handle, tool_item,
    };

    fn failed_record(category: TodoFailureCategory) -> TodoExecutionRecord {
        TodoExecutionRecord {
            failure_category: Some(category),
            precheck_report: Some(json!({"issues": ["code must not be empty"]})),
            ..TodoExecutionRecord::failed("STATIC_PRECHECK_FAILED: code must not be empty", 0)
        }
    }

    fn recover_with(
        agent: &RecoveryAgent<'_>,
        category: TodoFailureCategory,
        primary: &ModelHandle,
        sink: &RecordingEventSink,
    ) -> Option<RecoveryPlan> {
        let todo = tool_item("t1", 1, "executePython", json!({"code": ""}));
        let record = failed_record(category);
        let context = ExecutionContext::new();
        let tags = ExecutionTags::for_run("run-1", "user-1");
        let events = EventEmitter::new(sink, "run-1", "user-1");
        agent.recover(
            &RecoveryRequest {
                user_goal: "goal",
                todo: &todo,
                record: &record,
                category,
                context: &context,
                tags: &tags,
            },
            primary,
            &events,
        )
    }

    #[test]
    fn usable_params_produce_plan_with_decision_trace() {
        let primary = Arc::new(ScriptedChatModel::new([
            "```json\n{\"params\": {\"code\": \"print(1)\"}, \"reasoning\": \"fill code\"}\n```",
        ]));
        let provider = StaticModelProvider::default();
        let prompts = PromptEngine::new();
        let sink = RecordingEventSink::default();
        let agent = RecoveryAgent::new(&provider, None, &prompts);

        let plan = recover_with(&agent, TodoFailureCategory::Runtime, &model_handle(&primary), &sink)
            .expect("plan");

        assert_eq!(plan.params["code"], json!("print(1)"));
        assert_eq!(plan.decision.stage, RECOVERY_STAGE);
        assert_eq!(plan.decision.llm_trace_id, "trace-1");
        assert_eq!(
            sink.kinds(),
            vec!["TODO_RECOVERY_STARTED", "TODO_RECOVERY_COMPLETED"]
        );

        let payload: Value =
            serde_json::from_str(primary.requests()[0].user_text()).expect("payload");
        assert_eq!(payload["failed_todo"]["error_category"], json!("RUNTIME"));
        assert_eq!(
            payload["failed_todo"]["precheck_report"]["issues"][0],
            json!("code must not be empty")
        );
        assert_eq!(payload["failed_todo"]["semantic_judge_report"], json!({}));
    }

    #[test]
    fn abandon_empty_params_and_errors_end_recovery() {
        let provider = StaticModelProvider::default();
        let prompts = PromptEngine::new();
        let sink = RecordingEventSink::default();
        let agent = RecoveryAgent::new(&provider, None, &prompts);

        for reply in [
            r#"{"abandon": true, "params": {"code": "x"}}"#,
            r#"{"params": {}}"#,
            "I cannot help with that",
        ] {
            let primary = Arc::new(ScriptedChatModel::new([reply]));
            assert!(
                recover_with(&agent, TodoFailureCategory::Runtime, &model_handle(&primary), &sink)
                    .is_none(),
                "{reply}"
            );
        }

        let failing = Arc::new(ScriptedChatModel::default());
        assert!(
            recover_with(&agent, TodoFailureCategory::Runtime, &model_handle(&failing), &sink)
                .is_none()
        );
    }

    /// Verifies STATIC failures use the static-fix model and other
    /// categories keep the run model.
    #[test]
    fn static_failures_use_static_fix_model() {
        let fixer = Arc::new(ScriptedChatModel::new([r#"{"params": {"code": "print(2)"}}"#]));
        let provider = StaticModelProvider::default().with_model("cheap", "fixer", fixer.clone());
        let route = ModelRoute {
            endpoint: "cheap".to_string(),
            model: "fixer".to_string(),
            temperature: Some(0.1),
        };
        let prompts = PromptEngine::new();
        let sink = RecordingEventSink::default();
        let agent = RecoveryAgent::new(&provider, Some(&route), &prompts);

        let primary = Arc::new(ScriptedChatModel::new([r#"{"params": {"code": "print(3)"}}"#]));
        let plan = recover_with(&agent, TodoFailureCategory::Static, &model_handle(&primary), &sink)
            .expect("plan");
        assert_eq!(plan.params["code"], json!("print(2)"));
        assert_eq!(fixer.calls(), 1);
        assert_eq!(primary.calls(), 0);
        let completed = sink.payloads("TODO_RECOVERY_COMPLETED");
        assert_eq!(completed[0]["using_static_fix_model"], json!(true));
        assert_eq!(completed[0]["recovery_model"], json!("fixer"));

        let plan = recover_with(&agent, TodoFailureCategory::Semantic, &model_handle(&primary), &sink)
            .expect("plan");
        assert_eq!(plan.params["code"], json!("print(3)"));
        assert_eq!(primary.calls(), 1);
    }

    #[test]
    fn unresolvable_static_fix_model_falls_back_to_run_model() {
        let provider = StaticModelProvider::default();
        let route = ModelRoute {
            endpoint: "cheap".to_string(),
            model: "missing".to_string(),
            temperature: None,
        };
        let prompts = PromptEngine::new();
        let sink = RecordingEventSink::default();
        let agent = RecoveryAgent::new(&provider, Some(&route), &prompts);
        let primary = Arc::new(ScriptedChatModel::new([r#"{"params": {"code": "print(4)"}}"#]));

        let plan = recover_with(&agent, TodoFailureCategory::Static, &model_handle(&primary), &sink)
            .expect("plan");

        assert_eq!(plan.params["code"], json!("print(4)"));
        assert_eq!(provider.resolved().len(), 1);
    }
}
