//! Durable checkpoint storage.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::types::WorkflowState;

/// Durable per-run checkpoint storage.
pub trait StateStore: Send + Sync {
    fn load_workflow_state(&self, run_id: &str) -> Result<Option<WorkflowState>>;
    fn save_workflow_state(&self, run_id: &str, state: &WorkflowState) -> Result<()>;
    fn clear_workflow_state(&self, run_id: &str) -> Result<()>;
}

/// One pretty-printed JSON file per run under `dir` (`<dir>/<run_id>.json`).
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, run_id: &str) -> Result<PathBuf> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && run_id != "."
            && run_id != "..";
        if !valid {
            return Err(anyhow!("invalid run id {run_id:?}"));
        }
        Ok(self.dir.join(format!("{run_id}.json")))
    }
}

impl StateStore for FileStateStore {
    fn load_workflow_state(&self, run_id: &str) -> Result<Option<WorkflowState>> {
        let path = self.path_for(run_id)?;
        if !path.exists() {
            debug!(run_id, "no checkpoint");
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read checkpoint {}", path.display()))?;
        let state: WorkflowState = serde_json::from_str(&contents)
            .with_context(|| format!("parse checkpoint {}", path.display()))?;
        debug!(
            run_id,
            current_index = state.current_index,
            tool_calls_used = state.tool_calls_used,
            "checkpoint loaded"
        );
        Ok(Some(state))
    }

    fn save_workflow_state(&self, run_id: &str, state: &WorkflowState) -> Result<()> {
        let path = self.path_for(run_id)?;
        debug!(run_id, current_index = state.current_index, "writing checkpoint");
        let mut buf = serde_json::to_string_pretty(state)?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    fn clear_workflow_state(&self, run_id: &str) -> Result<()> {
        let path = self.path_for(run_id)?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("remove checkpoint {}", path.display()))?;
            debug!(run_id, "checkpoint cleared");
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("checkpoint path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp checkpoint {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace checkpoint {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExecutionContext, TodoExecutionRecord};
    use crate::test_support::tool_item;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn sample_state() -> WorkflowState {
        let item = tool_item("t1", 1, "searchIndex", json!({"keyword": "csi"}));
        let mut context = ExecutionContext::new();
        context.insert(
            "t1".to_string(),
            TodoExecutionRecord::succeeded("{\"ok\":true}", "{\"ok\":true}", 1),
        );
        WorkflowState {
            current_index: 1,
            completed_items: vec![item],
            context,
            tool_calls_used: 1,
            saved_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("time"),
        }
    }

    /// Verifies save → load returns an identical checkpoint.
    #[test]
    fn checkpoint_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path().join("checkpoints"));
        let state = sample_state();

        store.save_workflow_state("run-1", &state).expect("save");
        let loaded = store.load_workflow_state("run-1").expect("load");
        assert_eq!(loaded, Some(state));

        let contents = fs::read_to_string(temp.path().join("checkpoints/run-1.json")).expect("read");
        assert!(contents.ends_with("}\n"));
        assert!(!temp.path().join("checkpoints/run-1.json.tmp").exists());
    }

    #[test]
    fn clear_removes_checkpoint_and_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path());
        store.save_workflow_state("run-1", &sample_state()).expect("save");

        store.clear_workflow_state("run-1").expect("clear");
        store.clear_workflow_state("run-1").expect("clear again");
        assert_eq!(store.load_workflow_state("run-1").expect("load"), None);
    }

    #[test]
    fn run_ids_cannot_escape_the_directory() {
        let store = FileStateStore::new("/tmp/checkpoints");
        assert!(store.path_for("../etc/passwd").is_err());
        assert!(store.path_for("").is_err());
        assert!(store.path_for("run_2024-01.a").is_ok());
    }
}
