//! LLM-driven agents used by the workflow executor.
//!
//! Each agent borrows its collaborators for the duration of one call and
//! reports failures as data; only infrastructure errors surface as `Err`.

use jsonschema::{Draft, Validator};
use serde_json::Value;

pub mod judge;
pub mod recovery;
pub mod refinement;
pub mod sub_agent;
pub mod synthesis;

/// Compile a bundled Draft 2020-12 schema.
pub(crate) fn compile_schema(source: &str) -> Validator {
    let schema: Value = serde_json::from_str(source).expect("bundled schema should be valid JSON");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("bundled schema should compile")
}

pub(crate) fn schema_errors(validator: &Validator, instance: &Value) -> Vec<String> {
    validator
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect()
}
