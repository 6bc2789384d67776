//! Observability events and the cooperative run-control predicate.
//!
//! Events are the product-level audit trail of a run. Emission is
//! best-effort: sink failures are logged and dropped, never propagated.

use anyhow::Result;
use serde_json::Value;
use tracing::warn;

/// Fire-and-forget event sink.
pub trait EventSink: Send + Sync {
    fn append(&self, run_id: &str, user_id: &str, event_type: &str, payload: &Value) -> Result<()>;
}

/// External pause/cancel signal, consulted between todo items.
pub trait RunControl: Send + Sync {
    fn is_runnable(&self, run_id: &str, user_id: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TodoStarted,
    TodoFinished,
    TodoFailed,
    TodoRetry,
    TodoRecoveryStarted,
    TodoRecoveryCompleted,
    ToolCallStarted,
    ToolCallFinished,
    ToolCallLimitReached,
    ToolCallPlaceholderUnresolved,
    ToolCallStaticPrecheckFailed,
    SemanticJudgeRejected,
    SubAgentStarted,
    SubAgentFinished,
    SubAgentPlanRetry,
    SubAgentPlanCreated,
    SubAgentStepStarted,
    SubAgentPythonRefined,
    SubAgentStepFinished,
    SubAgentCompleted,
    SubAgentFailed,
    WorkflowPaused,
    FinalAnswerGenerating,
    FinalAnswerCompleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TodoStarted => "TODO_STARTED",
            Self::TodoFinished => "TODO_FINISHED",
            Self::TodoFailed => "TODO_FAILED",
            Self::TodoRetry => "TODO_RETRY",
            Self::TodoRecoveryStarted => "TODO_RECOVERY_STARTED",
            Self::TodoRecoveryCompleted => "TODO_RECOVERY_COMPLETED",
            Self::ToolCallStarted => "TOOL_CALL_STARTED",
            Self::ToolCallFinished => "TOOL_CALL_FINISHED",
            Self::ToolCallLimitReached => "TOOL_CALL_LIMIT_REACHED",
            Self::ToolCallPlaceholderUnresolved => "TOOL_CALL_PLACEHOLDER_UNRESOLVED",
            Self::ToolCallStaticPrecheckFailed => "TOOL_CALL_STATIC_PRECHECK_FAILED",
            Self::SemanticJudgeRejected => "SEMANTIC_JUDGE_REJECTED",
            Self::SubAgentStarted => "SUB_AGENT_STARTED",
            Self::SubAgentFinished => "SUB_AGENT_FINISHED",
            Self::SubAgentPlanRetry => "SUB_AGENT_PLAN_RETRY",
            Self::SubAgentPlanCreated => "SUB_AGENT_PLAN_CREATED",
            Self::SubAgentStepStarted => "SUB_AGENT_STEP_STARTED",
            Self::SubAgentPythonRefined => "SUB_AGENT_PYTHON_REFINED",
            Self::SubAgentStepFinished => "SUB_AGENT_STEP_FINISHED",
            Self::SubAgentCompleted => "SUB_AGENT_COMPLETED",
            Self::SubAgentFailed => "SUB_AGENT_FAILED",
            Self::WorkflowPaused => "WORKFLOW_PAUSED",
            Self::FinalAnswerGenerating => "FINAL_ANSWER_GENERATING",
            Self::FinalAnswerCompleted => "FINAL_ANSWER_COMPLETED",
        }
    }
}

/// Best-effort emitter bound to one run.
#[derive(Clone, Copy)]
pub struct EventEmitter<'a> {
    sink: &'a dyn EventSink,
    run_id: &'a str,
    user_id: &'a str,
}

impl<'a> EventEmitter<'a> {
    pub fn new(sink: &'a dyn EventSink, run_id: &'a str, user_id: &'a str) -> Self {
        Self {
            sink,
            run_id,
            user_id,
        }
    }

    /// Append an event. Skipped when the run or user id is blank; sink
    /// errors are logged and swallowed.
    pub fn emit(&self, kind: EventKind, payload: Value) {
        if self.run_id.trim().is_empty() || self.user_id.trim().is_empty() {
            return;
        }
        if let Err(err) = self
            .sink
            .append(self.run_id, self.user_id, kind.as_str(), &payload)
        {
            warn!(
                run_id = self.run_id,
                event = kind.as_str(),
                error = %format!("{err:#}"),
                "event emission failed"
            );
        }
    }
}
