//! Offline inspection CLI for todo-runner.
//!
//! Runs are driven by an embedding service through
//! [`todo_runner::workflow::LinearWorkflowExecutor`]; this binary covers the
//! pieces that are useful without live models or tools: the static precheck,
//! checkpoints, effective configuration and plan files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use jsonschema::Draft;
use serde_json::Value;
use todo_runner::core::invariants::duplicate_ids;
use todo_runner::core::precheck::{DatasetCodePrecheck, StaticPrecheck};
use todo_runner::core::run_args::sanitize_run_args;
use todo_runner::core::types::{Params, TodoItem};
use todo_runner::exit_codes;
use todo_runner::io::config::{WorkflowConfig, load_config_layer};
use todo_runner::io::state_store::{FileStateStore, StateStore};
use todo_runner::logging;

const PLAN_SCHEMA: &str = include_str!("../schemas/todo_plan.schema.json");
const DEFAULT_STATE_DIR: &str = ".todo-runner/state";

#[derive(Parser)]
#[command(
    name = "todo-runner",
    version,
    about = "Linear todo-workflow executor tooling"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Raise crate log verbosity (`-v` info, `-vv` debug); `RUST_LOG` wins.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run the static precheck over a code file and print the JSON report.
    Precheck {
        /// Python source to check.
        #[arg(long)]
        code: PathBuf,
        /// Comma-separated dataset ids (or a `[...]` list).
        #[arg(long, default_value = "")]
        dataset_ids: String,
        /// Requested sandbox timeout, clamped like a real run.
        #[arg(long)]
        timeout_seconds: Option<i64>,
    },
    /// Inspect or remove a run checkpoint.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
        /// Directory holding `<run-id>.json` checkpoints.
        #[arg(long, global = true, default_value = DEFAULT_STATE_DIR)]
        state_dir: PathBuf,
    },
    /// Print the effective configuration resolved from the two TOML layers.
    Config {
        #[arg(long)]
        base: Option<PathBuf>,
        #[arg(long)]
        local: Option<PathBuf>,
    },
    /// Check a todo plan file against the plan schema and for duplicate ids.
    ValidatePlan { plan: PathBuf },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the checkpoint as JSON.
    Show { run_id: String },
    /// Delete the checkpoint (no-op when absent).
    Clear { run_id: String },
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init(cli.verbose) {
        eprintln!("{err:#}");
    }
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Precheck {
            code,
            dataset_ids,
            timeout_seconds,
        } => cmd_precheck(&code, &dataset_ids, timeout_seconds),
        Command::Checkpoint { action, state_dir } => cmd_checkpoint(action, &state_dir),
        Command::Config { base, local } => cmd_config(base.as_deref(), local.as_deref()),
        Command::ValidatePlan { plan } => cmd_validate_plan(&plan),
    }
}

fn cmd_precheck(code_path: &Path, dataset_ids: &str, timeout_seconds: Option<i64>) -> Result<i32> {
    let code = fs::read_to_string(code_path)
        .with_context(|| format!("read {}", code_path.display()))?;
    let mut raw = Params::new();
    raw.insert("dataset_ids".to_string(), Value::String(dataset_ids.to_string()));
    if let Some(timeout) = timeout_seconds {
        raw.insert("timeout_seconds".to_string(), Value::from(timeout));
    }
    let outcome = DatasetCodePrecheck.check(&code, dataset_ids, &sanitize_run_args(&raw));
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome.report).context("serialize report")?
    );
    if outcome.passed {
        Ok(exit_codes::OK)
    } else {
        eprintln!("{}", outcome.summary());
        Ok(exit_codes::PRECHECK_FAILED)
    }
}

fn cmd_checkpoint(action: CheckpointAction, state_dir: &Path) -> Result<i32> {
    let store = FileStateStore::new(state_dir);
    match action {
        CheckpointAction::Show { run_id } => {
            let Some(state) = store.load_workflow_state(&run_id)? else {
                bail!("no checkpoint for run {run_id} in {}", state_dir.display());
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&state).context("serialize checkpoint")?
            );
        }
        CheckpointAction::Clear { run_id } => {
            store.clear_workflow_state(&run_id)?;
            println!("cleared {run_id}");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_config(base: Option<&Path>, local: Option<&Path>) -> Result<i32> {
    let load = |path: Option<&Path>| match path {
        Some(path) => load_config_layer(path),
        None => Ok(Default::default()),
    };
    let config = WorkflowConfig::resolve(&load(local)?, &load(base)?);
    println!(
        "{}",
        serde_json::to_string_pretty(&config).context("serialize config")?
    );
    Ok(exit_codes::OK)
}

fn cmd_validate_plan(path: &Path) -> Result<i32> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let plan = parse_plan(&raw)?;
    println!("ok: {} items", plan.len());
    Ok(exit_codes::OK)
}

/// Parse and validate a plan: schema conformance, then unique ids.
fn parse_plan(raw: &str) -> Result<Vec<TodoItem>> {
    let instance: Value = serde_json::from_str(raw).context("parse plan json")?;
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    let plan: Vec<TodoItem> = serde_json::from_value(instance).context("parse plan items")?;
    let duplicates = duplicate_ids(&plan);
    if !duplicates.is_empty() {
        bail!("duplicate todo ids: {}", duplicates.join(", "));
    }
    Ok(plan)
}
