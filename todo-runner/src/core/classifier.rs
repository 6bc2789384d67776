//! Deterministic classification of todo items and failure records.

use crate::core::types::{ExecutionMode, TodoAction, TodoExecutionRecord, TodoFailureCategory, TodoItem};

/// How the executor handles an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Reasoning note; succeeds without any call.
    Thought,
    /// Delegated to the sub-agent runner, executed once.
    SubAgent,
    /// Direct tool call through the retry-with-recovery loop.
    ToolCall,
}

/// Classify an item.
///
/// - `THOUGHT` items are always thoughts.
/// - `SUB_AGENT` items, and any item whose effective mode is
///   `FORCE_SUB_AGENT`, delegate to the sub-agent runner.
/// - Everything else is a direct tool call.
///
/// The item's own mode wins over `default_mode`.
pub fn classify_dispatch(item: &TodoItem, default_mode: ExecutionMode) -> Dispatch {
    let mode = item.execution_mode.unwrap_or(default_mode);
    match &item.action {
        TodoAction::Thought => Dispatch::Thought,
        TodoAction::SubAgent { .. } => Dispatch::SubAgent,
        TodoAction::ToolCall { .. } if mode == ExecutionMode::ForceSubAgent => Dispatch::SubAgent,
        TodoAction::ToolCall { .. } => Dispatch::ToolCall,
    }
}

/// Category charged for a failed record. Unset resolves to `RUNTIME`.
pub fn resolve_failure_category(record: &TodoExecutionRecord) -> TodoFailureCategory {
    record
        .failure_category
        .unwrap_or(TodoFailureCategory::Runtime)
}
