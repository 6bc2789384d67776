//! Shared deterministic types for the workflow core.
//!
//! These types define the stable contracts between the executor, the sub-agent
//! runner and the refinement loop. They are plain data: no I/O, no interior
//! mutability, and they serialize to the checkpoint format unchanged.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::Value;

/// Tool name of the sandboxed code-execution tool.
pub const CODE_EXECUTION_TOOL: &str = "executePython";

/// Insertion-ordered tool arguments.
pub type Params = serde_json::Map<String, Value>;

/// Records of processed items keyed by todo id, in the order they ran.
pub type ExecutionContext = IndexMap<String, TodoExecutionRecord>;

/// How an item should be executed when the plan leaves it to the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    #[default]
    Auto,
    ForceSimple,
    ForceSubAgent,
}

impl ExecutionMode {
    /// Parse a configured mode name. Unknown or blank names fall back to `Auto`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FORCE_SIMPLE" => Self::ForceSimple,
            "FORCE_SUB_AGENT" => Self::ForceSubAgent,
            _ => Self::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TodoStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// What a todo item does when executed.
///
/// Tagged by `type`; an item without one is a `TOOL_CALL`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TodoAction {
    ToolCall {
        tool_name: String,
        #[serde(default)]
        params: Params,
    },
    SubAgent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default)]
        params: Params,
    },
    Thought,
}

impl Serialize for TodoAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TodoAction::serialize(self, serializer)
    }
}

impl<'de> Deserialize<'de> for TodoAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut fields = Params::deserialize(deserializer)?;
        if fields.get("type").is_none_or(Value::is_null) {
            fields.insert("type".to_string(), Value::String("TOOL_CALL".to_string()));
        }
        TodoAction::deserialize(Value::Object(fields)).map_err(de::Error::custom)
    }
}

impl TodoAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolCall { .. } => "TOOL_CALL",
            Self::SubAgent { .. } => "SUB_AGENT",
            Self::Thought => "THOUGHT",
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::ToolCall { tool_name, .. } => Some(tool_name.as_str()),
            Self::SubAgent { tool_name, .. } => tool_name.as_deref(),
            Self::Thought => None,
        }
    }

    pub fn params(&self) -> Option<&Params> {
        match self {
            Self::ToolCall { params, .. } | Self::SubAgent { params, .. } => Some(params),
            Self::Thought => None,
        }
    }
}

/// Pointer to the LLM call that last decided this item's parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub llm_trace_id: String,
    pub stage: String,
    pub excerpt: String,
}

/// One planned step of a run.
///
/// Only the execution fields (`status`, `result_summary`, `output`,
/// `completed_at`, `decision`) and, after a recovery, the tool params change
/// once a plan is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub sequence: u32,
    #[serde(flatten)]
    pub action: TodoAction,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default)]
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionTrace>,
}

impl TodoItem {
    pub fn kind(&self) -> &'static str {
        self.action.kind()
    }

    pub fn tool_name(&self) -> &str {
        self.action.tool_name().unwrap_or_default()
    }

    /// Replace tool params after a successful recovery. No-op for thoughts.
    pub fn replace_params(&mut self, next: Params) {
        match &mut self.action {
            TodoAction::ToolCall { params, .. } | TodoAction::SubAgent { params, .. } => {
                *params = next;
            }
            TodoAction::Thought => {}
        }
    }
}

/// Why a tool call failed. Drives the retry budget and the recovery model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TodoFailureCategory {
    Static,
    Runtime,
    Semantic,
    Other,
}

impl TodoFailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "STATIC",
            Self::Runtime => "RUNTIME",
            Self::Semantic => "SEMANTIC",
            Self::Other => "OTHER",
        }
    }
}

/// Outcome of executing one item. A retry replaces the record, never edits it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TodoExecutionRecord {
    pub success: bool,
    pub output: String,
    pub summary: String,
    pub tool_calls_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<TodoFailureCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precheck_report: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_judge_report: Option<Value>,
}

impl TodoExecutionRecord {
    pub fn succeeded(output: impl Into<String>, summary: impl Into<String>, calls: u32) -> Self {
        Self {
            success: true,
            output: output.into(),
            summary: summary.into(),
            tool_calls_used: calls,
            ..Self::default()
        }
    }

    /// Failure with no output and no category.
    pub fn failed(summary: impl Into<String>, calls: u32) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            tool_calls_used: calls,
            ..Self::default()
        }
    }
}

/// Durable checkpoint of a run.
///
/// `current_index` is the next unprocessed plan index; `completed_items` and
/// `context` hold exactly the items before it, failed ones included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub current_index: usize,
    pub completed_items: Vec<TodoItem>,
    pub context: ExecutionContext,
    pub tool_calls_used: u32,
    pub saved_at: DateTime<Utc>,
}

/// Outcome handed back to the run driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowExecutionResult {
    pub paused: bool,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub final_answer: Option<String>,
    pub completed_items: Vec<TodoItem>,
    pub context: ExecutionContext,
    pub tool_calls_used: u32,
}

/// One executed sub-agent step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentStep {
    pub tool: String,
    pub args: Params,
    pub output: String,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubAgentResult {
    pub success: bool,
    pub answer: String,
    pub error: String,
    pub steps: Vec<SubAgentStep>,
}

impl SubAgentResult {
    pub fn failure(error: impl Into<String>, steps: Vec<SubAgentStep>) -> Self {
        Self {
            success: false,
            answer: String::new(),
            error: error.into(),
            steps,
        }
    }
}

/// One generate-and-execute attempt of the refinement loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptTrace {
    pub attempt: u32,
    pub code: String,
    pub run_args: Params,
    /// Prompts, raw response and error of the generation call, if one was made.
    pub llm_snapshot: Params,
    pub output: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefinementResult {
    pub success: bool,
    pub attempts_used: u32,
    pub output: String,
    pub traces: Vec<AttemptTrace>,
}
