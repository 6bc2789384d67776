//! Linear todo-workflow executor for autonomous agents.
//!
//! A run takes a previously planned, ordered list of todo items and executes
//! each one as a direct tool call, a delegated sub-agent run, or a reasoning
//! note. Failed tool calls are retried with model-proposed params under
//! budgets charged per failure category, and a checkpoint is written after
//! every item so an interrupted run resumes where it stopped.
//!
//! - **[`core`]**: Pure, deterministic logic (classification, budgets,
//!   placeholder resolution, payload extraction, static precheck).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Collaborator traits and adapters (state store, tools, chat
//!   models, events, configuration, prompt templates).
//! - **[`agents`]**: Model-driven pieces: code refinement, sub-agent runner,
//!   recovery, semantic judge, final-answer synthesis.
//!
//! [`workflow`] ties them together in [`workflow::LinearWorkflowExecutor`].

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
