//! Stable exit codes for todo-runner CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid input (plan, checkpoint, config) or other errors.
pub const INVALID: i32 = 1;
/// `todo-runner precheck` found issues in the code or dataset ids.
pub const PRECHECK_FAILED: i32 = 2;
