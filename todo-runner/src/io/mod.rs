//! Collaborator traits and side-effecting adapters.

pub mod config;
pub mod events;
pub mod llm;
pub mod prompt;
pub mod state_store;
pub mod tools;
