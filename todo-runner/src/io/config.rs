//! Layered workflow configuration.
//!
//! Two TOML layers feed one effective config: a local override layer and a
//! base layer. Each field resolves local → base → default and is clamped into
//! its allowed range. [`WorkflowConfig::resolve`] runs once per run; the
//! result is immutable.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::RecoveryLimits;
use crate::core::types::ExecutionMode;

/// One configuration layer (TOML). Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
    pub execution: ExecutionLayer,
    pub sub_agent: SubAgentLayer,
    pub judge: JudgeLayer,
    pub code_refine: CodeRefineLayer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLayer {
    pub max_tool_calls: Option<i64>,
    pub max_tool_calls_per_sub_agent: Option<i64>,
    pub max_retries_per_todo: Option<i64>,
    pub max_total_recovery_retries: Option<i64>,
    pub max_static_recovery_retries: Option<i64>,
    pub max_runtime_recovery_retries: Option<i64>,
    pub max_semantic_recovery_retries: Option<i64>,
    pub fail_fast: Option<bool>,
    pub default_execution_mode: Option<String>,
    pub static_precheck_enabled: Option<bool>,
    pub static_fix_endpoint: Option<String>,
    pub static_fix_model: Option<String>,
    pub static_fix_temperature: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubAgentLayer {
    pub enabled: Option<bool>,
    pub max_steps: Option<i64>,
    pub planning_max_attempts: Option<i64>,
    pub resolve_step_alias: Option<bool>,
    pub resolve_todo_alias: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeLayer {
    pub semantic_enabled: Option<bool>,
    pub max_attempts: Option<i64>,
    pub fail_open: Option<bool>,
    pub block_on_insufficient_evidence: Option<bool>,
    pub temperature: Option<f64>,
    pub routes: Vec<JudgeRoute>,
}

/// Candidate judge models on one endpoint, tried in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgeRoute {
    pub endpoint: String,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeRefineLayer {
    pub max_attempts: Option<i64>,
    pub requirements: Option<Vec<String>>,
    pub dataset_field_guide: Option<String>,
}

impl ConfigLayer {
    pub fn validate(&self) -> Result<()> {
        let temperatures = [
            ("execution.static_fix_temperature", self.execution.static_fix_temperature),
            ("judge.temperature", self.judge.temperature),
        ];
        for (name, value) in temperatures {
            match value {
                Some(value) if !(0.0..=2.0).contains(&value) => {
                    return Err(anyhow!("{name} must be within [0, 2], got {value}"));
                }
                _ => {}
            }
        }
        for (index, route) in self.judge.routes.iter().enumerate() {
            if route.endpoint.trim().is_empty() {
                return Err(anyhow!("judge.routes[{index}].endpoint must be non-empty"));
            }
            if route.models.iter().all(|model| model.trim().is_empty()) {
                return Err(anyhow!("judge.routes[{index}].models must name at least one model"));
            }
        }
        Ok(())
    }
}

/// Load a layer from TOML. A missing file yields an empty layer.
pub fn load_config_layer(path: &Path) -> Result<ConfigLayer> {
    if !path.exists() {
        return Ok(ConfigLayer::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let layer: ConfigLayer =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    layer
        .validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(layer)
}

/// Endpoint/model pair used to build a secondary chat model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRoute {
    pub endpoint: String,
    pub model: String,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionConfig {
    pub max_tool_calls: u32,
    pub max_tool_calls_per_sub_agent: u32,
    pub max_retries_per_todo: u32,
    pub max_total_recovery_retries: u32,
    pub max_static_recovery_retries: u32,
    pub max_runtime_recovery_retries: u32,
    pub max_semantic_recovery_retries: u32,
    pub fail_fast: bool,
    pub default_execution_mode: ExecutionMode,
    pub static_precheck_enabled: bool,
    /// Cheaper model for STATIC recoveries; `None` uses the run's model.
    pub static_fix: Option<ModelRoute>,
}

impl ExecutionConfig {
    pub fn recovery_limits(&self) -> RecoveryLimits {
        RecoveryLimits {
            max_retries_per_todo: self.max_retries_per_todo,
            max_total: self.max_total_recovery_retries,
            max_static: self.max_static_recovery_retries,
            max_runtime: self.max_runtime_recovery_retries,
            max_semantic: self.max_semantic_recovery_retries,
        }
    }

    /// Step budget handed to a delegated sub-agent.
    pub fn sub_agent_step_budget(&self, sub_agent: &SubAgentConfig) -> u32 {
        self.max_tool_calls_per_sub_agent.min(sub_agent.max_steps)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubAgentConfig {
    pub enabled: bool,
    pub max_steps: u32,
    pub planning_max_attempts: u32,
    pub resolve_step_alias: bool,
    pub resolve_todo_alias: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JudgeConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub fail_open: bool,
    pub block_on_insufficient_evidence: bool,
    pub temperature: f64,
    pub routes: Vec<JudgeRoute>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefineConfig {
    pub max_attempts: u32,
    pub requirements: Vec<String>,
    pub dataset_field_guide: String,
}

/// Effective configuration of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowConfig {
    pub execution: ExecutionConfig,
    pub sub_agent: SubAgentConfig,
    pub judge: JudgeConfig,
    pub code_refine: RefineConfig,
}

const DEFAULT_REQUIREMENTS: &[&str] = &[
    "Read input data only from /sandbox/input/<dataset_id>/ and write any files under /tmp.",
    "Assign dataset_id explicitly before using it in paths.",
    "Print the final result as a single JSON object on stdout.",
    "Use only the libraries listed in run_args plus the standard library, pandas and numpy.",
];

const DEFAULT_DATASET_FIELD_GUIDE: &str = "Each dataset directory holds a CSV with one row per \
trading day. Common columns: ts_code, trade_date (YYYYMMDD), open, high, low, close, pre_close, \
change, pct_chg, vol, amount.";

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self::resolve(&ConfigLayer::default(), &ConfigLayer::default())
    }
}

impl WorkflowConfig {
    pub fn resolve(local: &ConfigLayer, base: &ConfigLayer) -> Self {
        let (le, be) = (&local.execution, &base.execution);
        let max_retries = positive(le.max_retries_per_todo, be.max_retries_per_todo, 3, 1, 10);
        let max_total = non_negative(
            le.max_total_recovery_retries,
            be.max_total_recovery_retries,
            max_retries.saturating_sub(1),
            20,
        );
        let static_fix_model = text(&le.static_fix_model, &be.static_fix_model);
        let static_fix = static_fix_model.map(|model| ModelRoute {
            endpoint: text(&le.static_fix_endpoint, &be.static_fix_endpoint).unwrap_or_default(),
            model,
            temperature: le.static_fix_temperature.or(be.static_fix_temperature),
        });
        let execution = ExecutionConfig {
            max_tool_calls: positive(le.max_tool_calls, be.max_tool_calls, 20, 1, 200),
            max_tool_calls_per_sub_agent: positive(
                le.max_tool_calls_per_sub_agent,
                be.max_tool_calls_per_sub_agent,
                10,
                1,
                100,
            ),
            max_retries_per_todo: max_retries,
            max_total_recovery_retries: max_total,
            max_static_recovery_retries: non_negative(
                le.max_static_recovery_retries,
                be.max_static_recovery_retries,
                max_total,
                20,
            ),
            max_runtime_recovery_retries: non_negative(
                le.max_runtime_recovery_retries,
                be.max_runtime_recovery_retries,
                max_total,
                20,
            ),
            max_semantic_recovery_retries: non_negative(
                le.max_semantic_recovery_retries,
                be.max_semantic_recovery_retries,
                max_total,
                20,
            ),
            fail_fast: le.fail_fast.or(be.fail_fast).unwrap_or(false),
            default_execution_mode: text(&le.default_execution_mode, &be.default_execution_mode)
                .map(|mode| ExecutionMode::parse_lenient(&mode))
                .unwrap_or_default(),
            static_precheck_enabled: le
                .static_precheck_enabled
                .or(be.static_precheck_enabled)
                .unwrap_or(true),
            static_fix,
        };

        let (ls, bs) = (&local.sub_agent, &base.sub_agent);
        let sub_agent = SubAgentConfig {
            enabled: ls.enabled.or(bs.enabled).unwrap_or(true),
            max_steps: positive(ls.max_steps, bs.max_steps, 6, 1, 20),
            planning_max_attempts: positive(
                ls.planning_max_attempts,
                bs.planning_max_attempts,
                3,
                1,
                10,
            ),
            resolve_step_alias: ls.resolve_step_alias.or(bs.resolve_step_alias).unwrap_or(true),
            resolve_todo_alias: ls.resolve_todo_alias.or(bs.resolve_todo_alias).unwrap_or(true),
        };

        let (lj, bj) = (&local.judge, &base.judge);
        let judge = JudgeConfig {
            enabled: lj.semantic_enabled.or(bj.semantic_enabled).unwrap_or(false),
            max_attempts: positive(lj.max_attempts, bj.max_attempts, 2, 1, 10),
            fail_open: lj.fail_open.or(bj.fail_open).unwrap_or(true),
            block_on_insufficient_evidence: lj
                .block_on_insufficient_evidence
                .or(bj.block_on_insufficient_evidence)
                .unwrap_or(false),
            temperature: lj.temperature.or(bj.temperature).unwrap_or(0.0),
            routes: if lj.routes.is_empty() {
                bj.routes.clone()
            } else {
                lj.routes.clone()
            },
        };

        let (lr, br) = (&local.code_refine, &base.code_refine);
        let code_refine = RefineConfig {
            max_attempts: positive(lr.max_attempts, br.max_attempts, 3, 1, 10),
            requirements: lr
                .requirements
                .clone()
                .or_else(|| br.requirements.clone())
                .unwrap_or_else(|| DEFAULT_REQUIREMENTS.iter().map(|s| s.to_string()).collect()),
            dataset_field_guide: text(&lr.dataset_field_guide, &br.dataset_field_guide)
                .unwrap_or_else(|| DEFAULT_DATASET_FIELD_GUIDE.to_string()),
        };

        Self {
            execution,
            sub_agent,
            judge,
            code_refine,
        }
    }
}

/// First positive value (local, then base), else `default`; clamped.
fn positive(local: Option<i64>, base: Option<i64>, default: u32, min: u32, max: u32) -> u32 {
    let value = [local, base]
        .into_iter()
        .flatten()
        .find(|value| *value > 0)
        .unwrap_or(i64::from(default));
    value.clamp(i64::from(min), i64::from(max)) as u32
}

/// First non-negative value (local, then base), else `default`; clamped to
/// `0..=max`.
fn non_negative(local: Option<i64>, base: Option<i64>, default: u32, max: u32) -> u32 {
    let value = [local, base]
        .into_iter()
        .flatten()
        .find(|value| *value >= 0)
        .unwrap_or(i64::from(default));
    value.clamp(0, i64::from(max)) as u32
}

fn text(local: &Option<String>, base: &Option<String>) -> Option<String> {
    [local, base]
        .into_iter()
        .flatten()
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = WorkflowConfig::default();
        assert_eq!(cfg.execution.max_tool_calls, 20);
        assert_eq!(cfg.execution.max_tool_calls_per_sub_agent, 10);
        assert_eq!(cfg.execution.max_retries_per_todo, 3);
        assert_eq!(cfg.execution.max_total_recovery_retries, 2);
        assert_eq!(cfg.execution.max_static_recovery_retries, 2);
        assert!(!cfg.execution.fail_fast);
        assert!(cfg.execution.static_precheck_enabled);
        assert_eq!(cfg.execution.static_fix, None);
        assert!(cfg.sub_agent.enabled);
        assert_eq!(cfg.sub_agent.max_steps, 6);
        assert_eq!(cfg.sub_agent.planning_max_attempts, 3);
        assert!(!cfg.judge.enabled);
        assert_eq!(cfg.judge.max_attempts, 2);
        assert!(cfg.judge.fail_open);
        assert_eq!(cfg.code_refine.max_attempts, 3);
        assert_eq!(
            cfg.execution.sub_agent_step_budget(&cfg.sub_agent),
            6
        );
    }

    #[test]
    fn local_overrides_base_and_values_are_clamped() {
        let base: ConfigLayer = toml::from_str(
            r#"
            [execution]
            max_tool_calls = 50
            max_retries_per_todo = 5
            fail_fast = true

            [judge]
            semantic_enabled = true
            routes = [{ endpoint = "base", models = ["judge-a"] }]
            "#,
        )
        .expect("base");
        let local: ConfigLayer = toml::from_str(
            r#"
            [execution]
            max_tool_calls = 999
            max_static_recovery_retries = 0
            default_execution_mode = "force_sub_agent"
            fail_fast = false

            [sub_agent]
            max_steps = 0
            "#,
        )
        .expect("local");

        let cfg = WorkflowConfig::resolve(&local, &base);
        assert_eq!(cfg.execution.max_tool_calls, 200);
        assert_eq!(cfg.execution.max_retries_per_todo, 5);
        assert_eq!(cfg.execution.max_total_recovery_retries, 4);
        assert_eq!(cfg.execution.max_static_recovery_retries, 0);
        assert_eq!(cfg.execution.max_runtime_recovery_retries, 4);
        assert!(!cfg.execution.fail_fast);
        assert_eq!(cfg.execution.default_execution_mode, ExecutionMode::ForceSubAgent);
        assert_eq!(cfg.sub_agent.max_steps, 6);
        assert!(cfg.judge.enabled);
        assert_eq!(cfg.judge.routes.len(), 1);
    }

    #[test]
    fn static_fix_requires_a_model_name() {
        let mut layer = ConfigLayer::default();
        layer.execution.static_fix_endpoint = Some("cheap".to_string());
        assert_eq!(WorkflowConfig::resolve(&layer, &ConfigLayer::default()).execution.static_fix, None);

        layer.execution.static_fix_model = Some("fixer-mini".to_string());
        layer.execution.static_fix_temperature = Some(0.1);
        let cfg = WorkflowConfig::resolve(&ConfigLayer::default(), &layer);
        assert_eq!(
            cfg.execution.static_fix,
            Some(ModelRoute {
                endpoint: "cheap".to_string(),
                model: "fixer-mini".to_string(),
                temperature: Some(0.1),
            })
        );
    }

    #[test]
    fn load_missing_returns_empty_layer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layer = load_config_layer(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(layer, ConfigLayer::default());
    }

    #[test]
    fn load_rejects_invalid_routes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("workflow.toml");
        fs::write(&path, "[[judge.routes]]\nendpoint = \"\"\nmodels = [\"m\"]\n").expect("write");
        let err = load_config_layer(&path).unwrap_err();
        assert!(format!("{err:#}").contains("judge.routes[0].endpoint"));
    }
}
