//! Observability tags carried into every delegated call.
//!
//! Tags are immutable values. A caller derives child tags for a nested call
//! (`with_stage`, `with_todo`, ...) and keeps its own copy untouched, so a
//! callee can never leak its stage or decision trace back into the caller.

use serde::Serialize;

use crate::core::types::{DecisionTrace, TodoItem};

pub const PHASE_WORKFLOW: &str = "workflow";
pub const PHASE_TOOL_EXECUTION: &str = "tool_execution";
pub const PHASE_SUB_AGENT: &str = "sub_agent";
pub const PHASE_RECOVERY: &str = "recovery";
pub const PHASE_JUDGE: &str = "semantic_judge";
pub const PHASE_SUMMARIZING: &str = "summarizing";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionTags {
    pub run_id: String,
    pub user_id: String,
    pub phase: Option<String>,
    pub stage: Option<String>,
    pub todo_id: Option<String>,
    pub todo_sequence: Option<u32>,
    pub sub_agent_step: Option<usize>,
    pub refine_attempt: Option<u32>,
    pub decision: Option<DecisionTrace>,
}

impl ExecutionTags {
    pub fn for_run(run_id: &str, user_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            user_id: user_id.to_string(),
            phase: Some(PHASE_WORKFLOW.to_string()),
            ..Self::default()
        }
    }

    pub fn with_phase(&self, phase: &str) -> Self {
        Self {
            phase: Some(phase.to_string()),
            ..self.clone()
        }
    }

    pub fn with_stage(&self, stage: &str) -> Self {
        Self {
            stage: Some(stage.to_string()),
            ..self.clone()
        }
    }

    /// Scope tags to a todo item, inheriting its decision trace.
    pub fn with_todo(&self, item: &TodoItem) -> Self {
        Self {
            todo_id: Some(item.id.clone()),
            todo_sequence: Some(item.sequence),
            decision: item.decision.clone(),
            ..self.clone()
        }
    }

    pub fn with_sub_agent_step(&self, index: usize) -> Self {
        Self {
            sub_agent_step: Some(index),
            ..self.clone()
        }
    }

    pub fn with_refine_attempt(&self, attempt: u32) -> Self {
        Self {
            refine_attempt: Some(attempt),
            ..self.clone()
        }
    }

    pub fn with_decision(&self, decision: DecisionTrace) -> Self {
        Self {
            decision: Some(decision),
            ..self.clone()
        }
    }

    pub fn stage(&self) -> &str {
        self.stage.as_deref().unwrap_or_default()
    }
}
