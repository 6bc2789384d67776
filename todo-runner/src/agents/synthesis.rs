//! Final answer synthesis over every processed todo item.

use std::fmt;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::core::tags::{ExecutionTags, PHASE_SUMMARIZING};
use crate::core::text::{RESULT_PREVIEW_CHARS, preview};
use crate::core::types::{ExecutionContext, TodoItem};
use crate::io::events::{EventEmitter, EventKind};
use crate::io::llm::{ChatRequest, ModelHandle};
use crate::io::prompt::PromptEngine;

const FINAL_ANSWER_STAGE: &str = "workflow_final_answer";

/// The final-answer model call failed after every item was processed.
///
/// The run's checkpoint stays at the end of the plan, so executing the run
/// again only repeats synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalAnswerError {
    pub run_id: String,
    pub message: String,
}

impl fmt::Display for FinalAnswerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "final answer synthesis failed for run {}: {}",
            self.run_id, self.message
        )
    }
}

impl std::error::Error for FinalAnswerError {}

pub struct SynthesisRequest<'a> {
    pub user_goal: &'a str,
    pub dialogue_context: Option<&'a str>,
    pub items: &'a [TodoItem],
    pub context: &'a ExecutionContext,
    pub tags: &'a ExecutionTags,
}

/// One `{id, sequence, type, status, summary}` row per processed item.
pub fn summary_rows(items: &[TodoItem]) -> Value {
    Value::Array(
        items
            .iter()
            .map(|item| {
                json!({
                    "id": item.id,
                    "sequence": item.sequence,
                    "type": item.kind(),
                    "status": item.status,
                    "summary": item.result_summary.as_deref().unwrap_or_default(),
                })
            })
            .collect(),
    )
}

/// Produce the final answer with one model call; not retried.
pub fn synthesize_final_answer(
    prompts: &PromptEngine,
    request: &SynthesisRequest<'_>,
    llm: &ModelHandle,
    events: &EventEmitter<'_>,
) -> Result<String> {
    events.emit(
        EventKind::FinalAnswerGenerating,
        json!({"completed_items": request.items.len()}),
    );

    let summary = summary_rows(request.items).to_string();
    let context = serde_json::to_string(request.context).context("serialize execution context")?;
    let system = prompts.final_system()?;
    let user = prompts.final_user(request.dialogue_context, request.user_goal, &summary, &context)?;
    let tags = request
        .tags
        .with_phase(PHASE_SUMMARIZING)
        .with_stage(FINAL_ANSWER_STAGE);

    let answer = match llm.generate(&ChatRequest::prompt(system, user, tags)) {
        Ok(response) => response.text,
        Err(err) => {
            warn!(run_id = %request.tags.run_id, error = %format!("{err:#}"), "final answer call failed");
            return Err(FinalAnswerError {
                run_id: request.tags.run_id.clone(),
                message: format!("{err:#}"),
            }
            .into());
        }
    };
    info!(run_id = %request.tags.run_id, chars = answer.chars().count(), "final answer generated");
    events.emit(
        EventKind::FinalAnswerCompleted,
        json!({
            "answer_preview": preview(&answer, RESULT_PREVIEW_CHARS),
            "endpoint": llm.endpoint,
            "model": llm.model_name,
        }),
    );
    Ok(answer)
}
