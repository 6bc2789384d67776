//! Prompt templates for every LLM call the runner makes.

use anyhow::Result;
use minijinja::{Environment, Value, context};
use serde::Serialize;

const TEMPLATES: &[(&str, &str)] = &[
    ("recovery_system", include_str!("prompts/recovery_system.md")),
    ("final_system", include_str!("prompts/final_system.md")),
    ("final_user", include_str!("prompts/final_user.md")),
    ("sub_agent_planner", include_str!("prompts/sub_agent_planner.md")),
    ("sub_agent_plan_user", include_str!("prompts/sub_agent_plan_user.md")),
    ("sub_agent_summary", include_str!("prompts/sub_agent_summary.md")),
    (
        "sub_agent_summary_user",
        include_str!("prompts/sub_agent_summary_user.md"),
    ),
    ("refine_system", include_str!("prompts/refine_system.md")),
    ("refine_user", include_str!("prompts/refine_user.md")),
    ("judge_system", include_str!("prompts/judge_system.md")),
];

/// One failed refinement attempt as shown to the code generator.
#[derive(Debug, Clone, Serialize)]
pub struct RefineHistoryEntry {
    pub attempt: u32,
    pub run_args: String,
    pub code: String,
    pub feedback: String,
}

/// Inputs of the code-generation user prompt.
#[derive(Debug, Clone)]
pub struct RefinePrompt<'a> {
    pub goal: &'a str,
    pub context: &'a str,
    pub coding_context: &'a str,
    pub run_args: &'a str,
    pub requirements: &'a [String],
    pub field_guide: &'a str,
    /// Most recent attempt first.
    pub history: &'a [RefineHistoryEntry],
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for &(name, source) in TEMPLATES {
            env.add_template(name, source)
                .expect("prompt template should be valid");
        }
        Self { env }
    }

    fn render(&self, name: &str, ctx: Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        Ok(template.render(ctx)?.trim().to_string())
    }

    pub fn recovery_system(&self) -> Result<String> {
        self.render("recovery_system", context! {})
    }

    pub fn final_system(&self) -> Result<String> {
        self.render("final_system", context! {})
    }

    pub fn final_user(
        &self,
        dialogue_context: Option<&str>,
        goal: &str,
        summary_json: &str,
        context_json: &str,
    ) -> Result<String> {
        self.render(
            "final_user",
            context! {
                dialogue_context => dialogue_context.map(str::trim).filter(|s| !s.is_empty()),
                goal => goal.trim(),
                summary => summary_json,
                context => context_json,
            },
        )
    }

    /// Planner system prompt; `tools` should already be sorted.
    pub fn sub_agent_planner(&self, tools: &[String], max_steps: u32) -> Result<String> {
        self.render(
            "sub_agent_planner",
            context! { tools => tools, max_steps => max_steps },
        )
    }

    pub fn sub_agent_plan_user(
        &self,
        goal: &str,
        context_json: &str,
        retry_hint: Option<&str>,
    ) -> Result<String> {
        self.render(
            "sub_agent_plan_user",
            context! {
                goal => goal.trim(),
                context => context_json,
                retry_hint => retry_hint.map(str::trim).filter(|s| !s.is_empty()),
            },
        )
    }

    pub fn sub_agent_summary(&self) -> Result<String> {
        self.render("sub_agent_summary", context! {})
    }

    pub fn sub_agent_summary_user(&self, goal: &str, steps_json: &str) -> Result<String> {
        self.render(
            "sub_agent_summary_user",
            context! { goal => goal.trim(), steps => steps_json },
        )
    }

    pub fn refine_system(&self) -> Result<String> {
        self.render("refine_system", context! {})
    }

    pub fn refine_user(&self, input: &RefinePrompt<'_>) -> Result<String> {
        let optional = |s: &str| Some(s.trim().to_string()).filter(|s| !s.is_empty());
        self.render(
            "refine_user",
            context! {
                goal => input.goal.trim(),
                context => optional(input.context),
                coding_context => optional(input.coding_context),
                run_args => input.run_args,
                requirements => input.requirements,
                field_guide => optional(input.field_guide),
                history => input.history,
            },
        )
    }

    pub fn judge_system(&self) -> Result<String> {
        self.render("judge_system", context! {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies every template parses and renders without inputs it needs.
    #[test]
    fn static_templates_render() {
        let engine = PromptEngine::new();
        for rendered in [
            engine.recovery_system().expect("recovery"),
            engine.final_system().expect("final"),
            engine.sub_agent_summary().expect("summary"),
            engine.refine_system().expect("refine"),
            engine.judge_system().expect("judge"),
        ] {
            assert!(rendered.starts_with("### "), "{rendered}");
        }
    }

    #[test]
    fn final_user_includes_dialogue_only_when_present() {
        let engine = PromptEngine::new();
        let without = engine
            .final_user(Some("  "), "goal", "[]", "{}")
            .expect("render");
        assert!(!without.contains("### Prior Dialogue"));
        assert!(without.starts_with("### Goal"));

        let with = engine
            .final_user(Some("earlier talk"), "goal", "[]", "{}")
            .expect("render");
        let dialogue = with.find("earlier talk").expect("dialogue");
        let goal = with.find("### Goal").expect("goal");
        assert!(dialogue < goal);
    }

    #[test]
    fn planner_lists_tools_and_step_cap() {
        let engine = PromptEngine::new();
        let tools = vec!["executePython".to_string(), "searchIndex".to_string()];
        let rendered = engine.sub_agent_planner(&tools, 4).expect("render");
        assert!(rendered.contains("- executePython\n- searchIndex\n"));
        assert!(rendered.contains("at most 4 steps"));
    }

    #[test]
    fn plan_user_carries_retry_hint() {
        let engine = PromptEngine::new();
        let first = engine.sub_agent_plan_user("goal", "{}", None).expect("render");
        assert!(!first.contains("<retry_hint>"));

        let retry = engine
            .sub_agent_plan_user("goal", "{}", Some("TOO_MANY_STEPS: 9 > 6"))
            .expect("render");
        assert!(retry.contains("TOO_MANY_STEPS: 9 > 6"));
    }

    /// Verifies failed attempts are rendered in the order given, before the
    /// output instruction.
    #[test]
    fn refine_user_renders_history_in_order() {
        let engine = PromptEngine::new();
        let requirements = vec!["print JSON".to_string()];
        let history = vec![
            RefineHistoryEntry {
                attempt: 2,
                run_args: "{}".to_string(),
                code: "print(2)".to_string(),
                feedback: "second failure".to_string(),
            },
            RefineHistoryEntry {
                attempt: 1,
                run_args: "{}".to_string(),
                code: "<empty>".to_string(),
                feedback: "first failure".to_string(),
            },
        ];
        let rendered = engine
            .refine_user(&RefinePrompt {
                goal: "compute returns",
                context: "",
                coding_context: "Task context:\nnone",
                run_args: "{\"timeout_seconds\":90}",
                requirements: &requirements,
                field_guide: "",
                history: &history,
            })
            .expect("render");

        assert!(!rendered.contains("### Context\n"));
        assert!(!rendered.contains("### Dataset Fields"));
        assert!(rendered.contains("- print JSON"));
        let second = rendered.find("second failure").expect("second");
        let first = rendered.find("first failure").expect("first");
        let output = rendered.find("### Output").expect("output");
        assert!(second < first);
        assert!(first < output);
    }
}
