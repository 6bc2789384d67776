//! Retry budgets and the per-run tool-call quota.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::core::types::TodoFailureCategory;

/// Effective retry caps for one todo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryLimits {
    pub max_retries_per_todo: u32,
    pub max_total: u32,
    pub max_static: u32,
    pub max_runtime: u32,
    pub max_semantic: u32,
}

/// Why the retry loop stopped asking for recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    CategoryExhausted,
    TotalExhausted,
    AttemptsExhausted,
    ToolQuotaExhausted,
}

impl RetryDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::CategoryExhausted => "category_budget_exhausted",
            Self::TotalExhausted => "total_budget_exhausted",
            Self::AttemptsExhausted => "attempts_exhausted",
            Self::ToolQuotaExhausted => "tool_call_limit_reached",
        }
    }
}

/// Per-todo recovery counters. Every counter starts at zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryBudget {
    limits: RecoveryLimits,
    pub attempts: u32,
    pub static_recoveries: u32,
    pub runtime_recoveries: u32,
    pub semantic_recoveries: u32,
    pub total_recoveries: u32,
}

impl RecoveryBudget {
    pub fn new(limits: RecoveryLimits) -> Self {
        Self {
            limits,
            attempts: 0,
            static_recoveries: 0,
            runtime_recoveries: 0,
            semantic_recoveries: 0,
            total_recoveries: 0,
        }
    }

    /// Count a failed attempt and decide whether another recovery is allowed.
    ///
    /// Checks run in a fixed order: category and total caps, then the attempt
    /// cap, then the shared tool-call quota.
    pub fn after_failure(
        &mut self,
        category: TodoFailureCategory,
        quota_exhausted: bool,
    ) -> RetryDecision {
        self.attempts += 1;
        if self.total_recoveries >= self.limits.max_total {
            return RetryDecision::TotalExhausted;
        }
        if self.used(category) >= self.cap(category) {
            return RetryDecision::CategoryExhausted;
        }
        if self.attempts >= self.limits.max_retries_per_todo {
            return RetryDecision::AttemptsExhausted;
        }
        if quota_exhausted {
            return RetryDecision::ToolQuotaExhausted;
        }
        RetryDecision::Retry
    }

    /// Charge one recovery against the category and the shared total.
    pub fn charge(&mut self, category: TodoFailureCategory) {
        self.total_recoveries += 1;
        match category {
            TodoFailureCategory::Static => self.static_recoveries += 1,
            TodoFailureCategory::Semantic => self.semantic_recoveries += 1,
            TodoFailureCategory::Runtime | TodoFailureCategory::Other => {
                self.runtime_recoveries += 1;
            }
        }
    }

    pub fn used(&self, category: TodoFailureCategory) -> u32 {
        match category {
            TodoFailureCategory::Static => self.static_recoveries,
            TodoFailureCategory::Semantic => self.semantic_recoveries,
            TodoFailureCategory::Runtime | TodoFailureCategory::Other => self.runtime_recoveries,
        }
    }

    fn cap(&self, category: TodoFailureCategory) -> u32 {
        match category {
            TodoFailureCategory::Static => self.limits.max_static,
            TodoFailureCategory::Semantic => self.limits.max_semantic,
            TodoFailureCategory::Runtime | TodoFailureCategory::Other => self.limits.max_runtime,
        }
    }
}

/// Per-run tool-call counter shared with delegated sub-agents.
///
/// Clones share the same underlying count. A counter is never shared across
/// runs.
#[derive(Debug, Clone)]
pub struct ToolCallCounter {
    used: Arc<AtomicU32>,
    limit: u32,
}

impl ToolCallCounter {
    pub fn new(limit: u32, already_used: u32) -> Self {
        Self {
            used: Arc::new(AtomicU32::new(already_used)),
            limit,
        }
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.used() >= self.limit
    }

    /// Add `calls` and return the new total.
    pub fn charge(&self, calls: u32) -> u32 {
        self.used.fetch_add(calls, Ordering::SeqCst) + calls
    }
}
