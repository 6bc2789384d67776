//! Deterministic, pure logic shared by the workflow executor and its agents.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod invariants;
pub mod payload;
pub mod placeholder;
pub mod precheck;
pub mod run_args;
pub mod step_args;
pub mod tags;
pub mod text;
pub mod types;
