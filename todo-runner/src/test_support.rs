//! Test-only builders and scripted collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::tags::ExecutionTags;
use crate::core::types::{Params, TodoAction, TodoItem, TodoStatus, WorkflowState};
use crate::io::events::{EventSink, RunControl};
use crate::io::llm::{ChatModel, ChatRequest, ChatResponse, ModelHandle, ModelProvider};
use crate::io::state_store::StateStore;
use crate::io::tools::{ToolInvocation, ToolInvoker};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Convert a JSON object literal into params; anything else yields empty params.
pub fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

fn item(id: &str, sequence: u32, action: TodoAction, reasoning: &str) -> TodoItem {
    TodoItem {
        id: id.to_string(),
        sequence,
        action,
        reasoning: reasoning.to_string(),
        execution_mode: None,
        status: TodoStatus::Pending,
        result_summary: None,
        output: None,
        completed_at: None,
        decision: None,
    }
}

/// Create a pending TOOL_CALL item.
pub fn tool_item(id: &str, sequence: u32, tool: &str, args: Value) -> TodoItem {
    item(
        id,
        sequence,
        TodoAction::ToolCall {
            tool_name: tool.to_string(),
            params: params(args),
        },
        &format!("{id} reasoning"),
    )
}

/// Create a pending THOUGHT item.
pub fn thought_item(id: &str, sequence: u32, reasoning: &str) -> TodoItem {
    item(id, sequence, TodoAction::Thought, reasoning)
}

/// Create a pending SUB_AGENT item with no tool name.
pub fn sub_agent_item(id: &str, sequence: u32, reasoning: &str, args: Value) -> TodoItem {
    item(
        id,
        sequence,
        TodoAction::SubAgent {
            tool_name: None,
            params: params(args),
        },
        reasoning,
    )
}

/// Chat model that replays queued responses in order and records requests.
///
/// An exhausted queue yields an error.
#[derive(Default)]
pub struct ScriptedChatModel {
    responses: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChatModel {
    pub fn new<'a>(responses: impl IntoIterator<Item = &'a str>) -> Self {
        let model = Self::default();
        for response in responses {
            model.push(response);
        }
        model
    }

    pub fn push(&self, response: &str) {
        lock(&self.responses).push_back(Ok(response.to_string()));
    }

    pub fn push_error(&self, message: &str) {
        lock(&self.responses).push_back(Err(message.to_string()));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }
}

impl ChatModel for ScriptedChatModel {
    fn generate(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let call_index = {
            let mut requests = lock(&self.requests);
            requests.push(request.clone());
            requests.len()
        };
        match lock(&self.responses).pop_front() {
            Some(Ok(text)) => Ok(ChatResponse {
                text,
                trace_id: Some(format!("trace-{call_index}")),
                ..ChatResponse::default()
            }),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted response left")),
        }
    }
}

/// Wrap a scripted model as the run's primary model.
pub fn model_handle(model: &Arc<ScriptedChatModel>) -> ModelHandle {
    ModelHandle {
        model: model.clone(),
        endpoint: "primary".to_string(),
        model_name: "primary-model".to_string(),
    }
}

/// One recorded tool invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub tool: String,
    pub args: Params,
    pub tags: ExecutionTags,
}

/// Tool invoker that replays per-tool queued outputs.
///
/// When a tool's queue is empty its fallback output is used; a tool with
/// neither yields an invoker error.
#[derive(Default)]
pub struct ScriptedToolInvoker {
    queued: Mutex<HashMap<String, VecDeque<Result<String, String>>>>,
    fallback: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedToolInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output returned for every call of `tool` once its queue is drained.
    pub fn always(self, tool: &str, output: &str) -> Self {
        lock(&self.fallback).insert(tool.to_string(), output.to_string());
        self
    }

    pub fn then(self, tool: &str, output: &str) -> Self {
        lock(&self.queued)
            .entry(tool.to_string())
            .or_default()
            .push_back(Ok(output.to_string()));
        self
    }

    pub fn then_error(self, tool: &str, message: &str) -> Self {
        lock(&self.queued)
            .entry(tool.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, tool: &str) -> usize {
        lock(&self.calls).iter().filter(|call| call.tool == tool).count()
    }
}

impl ToolInvoker for ScriptedToolInvoker {
    fn invoke_with_meta(
        &self,
        tool: &str,
        args: &Params,
        tags: &ExecutionTags,
    ) -> Result<ToolInvocation> {
        lock(&self.calls).push(RecordedCall {
            tool: tool.to_string(),
            args: args.clone(),
            tags: tags.clone(),
        });
        let next = lock(&self.queued)
            .get_mut(tool)
            .and_then(VecDeque::pop_front);
        let output = match next {
            Some(Ok(output)) => output,
            Some(Err(message)) => return Err(anyhow!(message)),
            None => lock(&self.fallback)
                .get(tool)
                .cloned()
                .ok_or_else(|| anyhow!("no scripted output for {tool}"))?,
        };
        Ok(ToolInvocation {
            success: true,
            output,
            cache: None,
        })
    }
}

/// In-memory checkpoint store.
#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, WorkflowState>>,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    pub fn get(&self, run_id: &str) -> Option<WorkflowState> {
        lock(&self.states).get(run_id).cloned()
    }

    pub fn insert(&self, run_id: &str, state: WorkflowState) {
        lock(&self.states).insert(run_id.to_string(), state);
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStateStore {
    fn load_workflow_state(&self, run_id: &str) -> Result<Option<WorkflowState>> {
        Ok(self.get(run_id))
    }

    fn save_workflow_state(&self, run_id: &str, state: &WorkflowState) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.insert(run_id, state.clone());
        Ok(())
    }

    fn clear_workflow_state(&self, run_id: &str) -> Result<()> {
        lock(&self.states).remove(run_id);
        Ok(())
    }
}

/// Event sink that records every appended event.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(String, Value)>>,
    failing: bool,
}

impl RecordingEventSink {
    /// A sink whose every append fails without recording.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn kinds(&self) -> Vec<String> {
        lock(&self.events).iter().map(|(kind, _)| kind.clone()).collect()
    }

    pub fn payloads(&self, kind: &str) -> Vec<Value> {
        lock(&self.events)
            .iter()
            .filter(|(recorded, _)| recorded == kind)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.payloads(kind).len()
    }
}

impl EventSink for RecordingEventSink {
    fn append(&self, _run_id: &str, _user_id: &str, event_type: &str, payload: &Value) -> Result<()> {
        if self.failing {
            return Err(anyhow!("event sink unavailable"));
        }
        lock(&self.events).push((event_type.to_string(), payload.clone()));
        Ok(())
    }
}

/// Run control that allows a fixed number of checks, then reports paused.
#[derive(Debug, Default)]
pub struct StaticRunControl {
    allowed_checks: Option<usize>,
    checks: AtomicUsize,
}

impl StaticRunControl {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn pause_after(checks: usize) -> Self {
        Self {
            allowed_checks: Some(checks),
            checks: AtomicUsize::new(0),
        }
    }
}

impl RunControl for StaticRunControl {
    fn is_runnable(&self, _run_id: &str, _user_id: &str) -> bool {
        let seen = self.checks.fetch_add(1, Ordering::SeqCst);
        self.allowed_checks.is_none_or(|allowed| seen < allowed)
    }
}

/// Model provider backed by a fixed `(endpoint, model)` table.
#[derive(Default)]
pub struct StaticModelProvider {
    models: HashMap<(String, String), Arc<dyn ChatModel>>,
    resolved: Mutex<Vec<(String, String)>>,
}

impl StaticModelProvider {
    pub fn with_model(mut self, endpoint: &str, model: &str, chat: Arc<dyn ChatModel>) -> Self {
        self.models
            .insert((endpoint.to_string(), model.to_string()), chat);
        self
    }

    /// Every `(endpoint, model)` pair requested so far, in order.
    pub fn resolved(&self) -> Vec<(String, String)> {
        lock(&self.resolved).clone()
    }
}

impl ModelProvider for StaticModelProvider {
    fn resolve(
        &self,
        endpoint: &str,
        model: &str,
        _temperature: Option<f64>,
    ) -> Result<Arc<dyn ChatModel>> {
        let key = (endpoint.to_string(), model.to_string());
        lock(&self.resolved).push(key.clone());
        self.models
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow!("unknown model {endpoint}/{model}"))
    }
}
