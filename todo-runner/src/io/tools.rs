//! Tool invocation interface.
//!
//! Concrete tools (market data lookups, the code sandbox) live outside this
//! crate. The executor and the sub-agent only see [`ToolInvoker`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::core::tags::ExecutionTags;
use crate::core::types::Params;

pub use crate::core::types::CODE_EXECUTION_TOOL;

/// Tool description offered to models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Cache metadata reported by the invoker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub success: bool,
    /// Tool output, expected to be JSON with an `ok` boolean field.
    pub output: String,
    pub cache: Option<CacheMeta>,
}

impl ToolInvocation {
    pub fn cache_hit(&self) -> bool {
        self.cache.as_ref().is_some_and(|cache| cache.hit)
    }
}

pub trait ToolInvoker: Send + Sync {
    fn invoke_with_meta(
        &self,
        tool: &str,
        args: &Params,
        tags: &ExecutionTags,
    ) -> Result<ToolInvocation>;

    fn invoke(&self, tool: &str, args: &Params, tags: &ExecutionTags) -> Result<String> {
        self.invoke_with_meta(tool, args, tags)
            .map(|invocation| invocation.output)
    }
}

/// Invoke a tool, folding invoker errors into a failed invocation whose
/// output is `{"ok": false, "error": ...}`.
pub fn invoke_guarded(
    invoker: &dyn ToolInvoker,
    tool: &str,
    args: &Params,
    tags: &ExecutionTags,
) -> ToolInvocation {
    match invoker.invoke_with_meta(tool, args, tags) {
        Ok(invocation) => invocation,
        Err(err) => {
            warn!(tool, stage = tags.stage(), error = %format!("{err:#}"), "tool invocation failed");
            ToolInvocation {
                success: false,
                output: json!({"ok": false, "error": format!("{err:#}")}).to_string(),
                cache: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct FailingInvoker;

    impl ToolInvoker for FailingInvoker {
        fn invoke_with_meta(
            &self,
            _tool: &str,
            _args: &Params,
            _tags: &ExecutionTags,
        ) -> Result<ToolInvocation> {
            Err(anyhow!("connection refused"))
        }
    }

    #[test]
    fn guarded_invocation_reports_errors_as_output() {
        let invocation = invoke_guarded(
            &FailingInvoker,
            "searchIndex",
            &Params::new(),
            &ExecutionTags::default(),
        );
        assert!(!invocation.success);
        assert!(!invocation.cache_hit());
        let output: Value = serde_json::from_str(&invocation.output).expect("json");
        assert_eq!(output, json!({"ok": false, "error": "connection refused"}));
    }

    #[test]
    fn default_invoke_propagates_errors() {
        let err = FailingInvoker
            .invoke("searchIndex", &Params::new(), &ExecutionTags::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "connection refused");
    }
}
