//! Iterative code generation against the sandbox.
//!
//! Every attempt sees the full history of earlier failures, most recent first,
//! so the generator can fix the actual cause instead of repeating itself.

use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::payload::{extract_code, extract_run_args, is_ok_payload};
use crate::core::run_args::{merge_run_args, sanitize_run_args};
use crate::core::tags::ExecutionTags;
use crate::core::text::{FEEDBACK_PREVIEW_CHARS, RESULT_PREVIEW_CHARS, preview};
use crate::core::types::{AttemptTrace, CODE_EXECUTION_TOOL, DecisionTrace, Params, RefinementResult};
use crate::io::config::RefineConfig;
use crate::io::llm::{ChatRequest, ModelHandle};
use crate::io::prompt::{PromptEngine, RefineHistoryEntry, RefinePrompt};
use crate::io::tools::{ToolInvoker, invoke_guarded};

const GENERATE_STAGE: &str = "python_code_generate";
const EMPTY_CODE_ERROR: &str = "generated code is empty";

/// One refinement run.
#[derive(Debug, Clone)]
pub struct RefinementRequest<'a> {
    pub goal: &'a str,
    pub context: &'a str,
    pub coding_context: &'a str,
    /// Code to run on the first attempt; blank means generate.
    pub initial_code: String,
    /// Baseline run args; sanitized before the first attempt.
    pub run_args: Params,
    pub tags: &'a ExecutionTags,
}

pub struct CodeRefinementLoop<'a> {
    tools: &'a dyn ToolInvoker,
    config: &'a RefineConfig,
    prompts: &'a PromptEngine,
}

struct Generated {
    code: String,
    run_args: Params,
    snapshot: Params,
    decision: Option<DecisionTrace>,
}

impl<'a> CodeRefinementLoop<'a> {
    pub fn new(tools: &'a dyn ToolInvoker, config: &'a RefineConfig, prompts: &'a PromptEngine) -> Self {
        Self {
            tools,
            config,
            prompts,
        }
    }

    #[instrument(skip_all, fields(todo_id = request.tags.todo_id.as_deref().unwrap_or_default()))]
    pub fn execute(&self, request: RefinementRequest<'_>, llm: &ModelHandle) -> RefinementResult {
        let max_attempts = self.config.max_attempts.max(1);
        let mut run_args = sanitize_run_args(&request.run_args);
        let mut code = request.initial_code.trim().to_string();
        let mut traces: Vec<AttemptTrace> = Vec::new();
        // Sandbox calls are attributed to the generation that produced their code.
        let mut decision: Option<DecisionTrace> = None;

        for attempt in 1..=max_attempts {
            let tags = request.tags.with_refine_attempt(attempt);
            let mut snapshot = Params::new();
            if code.is_empty() {
                let generated = self.generate(&request, &run_args, &traces, &tags, llm);
                code = generated.code;
                run_args = merge_run_args(&run_args, &generated.run_args);
                snapshot = generated.snapshot;
                if generated.decision.is_some() {
                    decision = generated.decision;
                }
            }

            if code.is_empty() {
                debug!(attempt, "no code to run");
                traces.push(AttemptTrace {
                    attempt,
                    code: String::new(),
                    run_args: run_args.clone(),
                    llm_snapshot: snapshot,
                    output: json!({"ok": false, "error": EMPTY_CODE_ERROR}).to_string(),
                    success: false,
                });
                continue;
            }

            let mut args = run_args.clone();
            args.insert("code".to_string(), Value::String(code.clone()));
            let execute_tags = match &decision {
                Some(decision) => tags.with_decision(decision.clone()),
                None => tags.clone(),
            };
            let invocation = invoke_guarded(self.tools, CODE_EXECUTION_TOOL, &args, &execute_tags);
            let success = invocation.success && is_ok_payload(&invocation.output);
            debug!(attempt, success, "sandbox attempt finished");
            traces.push(AttemptTrace {
                attempt,
                code: code.clone(),
                run_args: run_args.clone(),
                llm_snapshot: snapshot,
                output: invocation.output.clone(),
                success,
            });
            if success {
                info!(attempt, "code execution succeeded");
                return RefinementResult {
                    success: true,
                    attempts_used: attempt_count(&traces),
                    output: invocation.output,
                    traces,
                };
            }
            code.clear();
        }

        let last_error = traces
            .last()
            .map(|trace| preview(&trace.output, RESULT_PREVIEW_CHARS))
            .unwrap_or_default();
        warn!(attempts = traces.len(), "code execution failed on every attempt");
        RefinementResult {
            success: false,
            attempts_used: attempt_count(&traces),
            output: format!(
                "Python execution failed after {} attempts. last_error={last_error}",
                traces.len()
            ),
            traces,
        }
    }

    fn generate(
        &self,
        request: &RefinementRequest<'_>,
        run_args: &Params,
        traces: &[AttemptTrace],
        tags: &ExecutionTags,
        llm: &ModelHandle,
    ) -> Generated {
        let run_args_json = Value::Object(run_args.clone()).to_string();
        let history = failure_history(traces);
        let mut snapshot = Params::new();
        snapshot.insert("run_args".to_string(), Value::Object(run_args.clone()));

        let prompts = self.prompts.refine_system().and_then(|system| {
            let user = self.prompts.refine_user(&RefinePrompt {
                goal: request.goal,
                context: request.context,
                coding_context: request.coding_context,
                run_args: &run_args_json,
                requirements: &self.config.requirements,
                field_guide: &self.config.dataset_field_guide,
                history: &history,
            })?;
            Ok((system, user))
        });
        let (system, user) = match prompts {
            Ok(pair) => pair,
            Err(err) => {
                snapshot.insert("error".to_string(), json!(format!("{err:#}")));
                return Generated {
                    code: String::new(),
                    run_args: Params::new(),
                    snapshot,
                    decision: None,
                };
            }
        };
        snapshot.insert("system_prompt".to_string(), json!(system));
        snapshot.insert("user_prompt".to_string(), json!(user));

        let chat = ChatRequest::prompt(system, user, tags.with_stage(GENERATE_STAGE));
        match llm.generate(&chat) {
            Ok(response) => {
                snapshot.insert("raw_response".to_string(), json!(response.text));
                let decision = response.trace_id.as_ref().map(|trace_id| {
                    snapshot.insert("llm_trace_id".to_string(), json!(trace_id));
                    DecisionTrace {
                        llm_trace_id: trace_id.clone(),
                        stage: GENERATE_STAGE.to_string(),
                        excerpt: preview(&response.text, RESULT_PREVIEW_CHARS),
                    }
                });
                Generated {
                    code: extract_code(&response.text),
                    run_args: extract_run_args(&response.text),
                    snapshot,
                    decision,
                }
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "code generation failed");
                snapshot.insert("raw_response".to_string(), json!(""));
                snapshot.insert("error".to_string(), json!(format!("{err:#}")));
                Generated {
                    code: String::new(),
                    run_args: Params::new(),
                    snapshot,
                    decision: None,
                }
            }
        }
    }
}

fn attempt_count(traces: &[AttemptTrace]) -> u32 {
    u32::try_from(traces.len()).unwrap_or(u32::MAX)
}

/// Failed attempts, most recent first.
fn failure_history(traces: &[AttemptTrace]) -> Vec<RefineHistoryEntry> {
    traces
        .iter()
        .rev()
        .filter(|trace| !trace.success)
        .map(|trace| RefineHistoryEntry {
            attempt: trace.attempt,
            run_args: Value::Object(trace.run_args.clone()).to_string(),
            code: or_empty_marker(trace.code.clone()),
            feedback: or_empty_marker(preview(&trace.output, FEEDBACK_PREVIEW_CHARS)),
        })
        .collect()
}

fn or_empty_marker(text: String) -> String {
    if text.trim().is_empty() {
        "<empty>".to_string()
    } else {
        text
    }
}
