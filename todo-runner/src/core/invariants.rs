//! Checkpoint invariants not expressible in the serialized format.

use std::collections::HashSet;

use crate::core::types::{TodoItem, WorkflowState};

/// Check a loaded checkpoint against the plan it is resumed with:
/// - `current_index <= plan.len()`
/// - `completed_items` are exactly the plan prefix before `current_index`
/// - every completed item has a record in `context`, and nothing else does
pub fn validate_checkpoint(plan: &[TodoItem], state: &WorkflowState) -> Vec<String> {
    let mut errors = Vec::new();

    if state.current_index > plan.len() {
        errors.push(format!(
            "current_index {} exceeds plan length {}",
            state.current_index,
            plan.len()
        ));
        return errors;
    }

    if state.completed_items.len() != state.current_index {
        errors.push(format!(
            "completed_items has {} entries but current_index is {}",
            state.completed_items.len(),
            state.current_index
        ));
    }

    for (index, (done, planned)) in state.completed_items.iter().zip(plan).enumerate() {
        if done.id != planned.id {
            errors.push(format!(
                "completed item {} is '{}' but plan has '{}'",
                index, done.id, planned.id
            ));
        }
    }

    let completed: HashSet<&str> = state
        .completed_items
        .iter()
        .map(|item| item.id.as_str())
        .collect();
    for item in &state.completed_items {
        if !state.context.contains_key(&item.id) {
            errors.push(format!("completed item '{}' missing from context", item.id));
        }
    }
    for id in state.context.keys() {
        if !completed.contains(id.as_str()) {
            errors.push(format!("context has record for unprocessed item '{id}'"));
        }
    }

    errors
}

/// Ids that appear more than once in a plan, in plan order.
pub fn duplicate_ids(plan: &[TodoItem]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for item in plan {
        if !seen.insert(item.id.as_str()) && !duplicates.contains(&item.id) {
            duplicates.push(item.id.clone());
        }
    }
    duplicates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExecutionContext, TodoExecutionRecord};
    use crate::test_support::thought_item;
    use chrono::Utc;

    fn plan() -> Vec<TodoItem> {
        vec![
            thought_item("a", 1, "one"),
            thought_item("b", 2, "two"),
            thought_item("c", 3, "three"),
        ]
    }

    fn state(done: &[TodoItem], index: usize) -> WorkflowState {
        let mut context = ExecutionContext::new();
        for item in done {
            context.insert(item.id.clone(), TodoExecutionRecord::succeeded("", "", 0));
        }
        WorkflowState {
            current_index: index,
            completed_items: done.to_vec(),
            context,
            tool_calls_used: 0,
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn prefix_checkpoint_is_valid() {
        let plan = plan();
        assert!(validate_checkpoint(&plan, &state(&plan[..2], 2)).is_empty());
        assert!(validate_checkpoint(&plan, &state(&plan, 3)).is_empty());
    }

    #[test]
    fn reordered_or_overlong_checkpoint_is_rejected() {
        let plan = plan();
        let swapped = vec![plan[1].clone(), plan[0].clone()];
        let errors = validate_checkpoint(&plan, &state(&swapped, 2));
        assert!(errors.iter().any(|err| err.contains("completed item 0 is 'b'")));

        let errors = validate_checkpoint(&plan, &state(&plan, 4));
        assert!(errors[0].contains("exceeds plan length"));
    }

    #[test]
    fn context_must_match_completed_items() {
        let plan = plan();
        let mut bad = state(&plan[..1], 1);
        bad.context
            .insert("c".to_string(), TodoExecutionRecord::succeeded("", "", 0));
        let errors = validate_checkpoint(&plan, &bad);
        assert_eq!(errors, vec!["context has record for unprocessed item 'c'".to_string()]);
    }

    #[test]
    fn duplicate_ids_reported_once() {
        let plan = vec![
            thought_item("a", 1, ""),
            thought_item("a", 2, ""),
            thought_item("a", 3, ""),
            thought_item("b", 4, ""),
        ];
        assert_eq!(duplicate_ids(&plan), vec!["a".to_string()]);
    }
}
