//! Chat model interface.
//!
//! Calls are synchronous request/response from the caller's point of view;
//! timeouts are the client's business.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::core::tags::ExecutionTags;
use crate::io::tools::ToolSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Tool specs offered to the model; empty for plain completions.
    pub tools: Vec<ToolSpec>,
    pub tags: ExecutionTags,
}

impl ChatRequest {
    /// System + user message pair with no tools.
    pub fn prompt(system: impl Into<String>, user: impl Into<String>, tags: ExecutionTags) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            tools: Vec::new(),
            tags,
        }
    }

    pub fn user_text(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
            .unwrap_or_default()
    }

    pub fn system_text(&self) -> &str {
        self.messages
            .iter()
            .find(|message| message.role == Role::System)
            .map(|message| message.content.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatResponse {
    pub text: String,
    pub token_usage: TokenUsage,
    /// Identifier of the recorded LLM call, used for decision traces.
    pub trace_id: Option<String>,
}

pub trait ChatModel: Send + Sync {
    fn generate(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

/// Builds chat models for secondary routes (static-fix model, judge routes).
pub trait ModelProvider: Send + Sync {
    fn resolve(
        &self,
        endpoint: &str,
        model: &str,
        temperature: Option<f64>,
    ) -> Result<Arc<dyn ChatModel>>;
}

/// A chat model together with the names it is reported under.
#[derive(Clone)]
pub struct ModelHandle {
    pub model: Arc<dyn ChatModel>,
    pub endpoint: String,
    pub model_name: String,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("endpoint", &self.endpoint)
            .field("model_name", &self.model_name)
            .finish()
    }
}

impl ModelHandle {
    pub fn generate(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.model.generate(request)
    }
}
