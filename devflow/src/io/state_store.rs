//! Checkpoint persistence with schema validation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::state::ExecutionState;
use crate::error::FlowError;
use crate::io::definition::validate_id;

const CHECKPOINT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/checkpoint/v1.schema.json"
));

/// Durable storage for checkpoints, keyed by workflow id.
///
/// `save` must be atomic: a concurrent or later `load` never observes a
/// partially written checkpoint.
pub trait StateStore {
    fn save(&self, state: &ExecutionState) -> Result<()>;

    /// `Ok(None)` when no checkpoint exists for `workflow_id`.
    fn load(&self, workflow_id: &str) -> Result<Option<ExecutionState>, FlowError>;
}

/// One pretty-printed JSON file per workflow id under a state directory.
pub struct FileStateStore {
    dir: PathBuf,
    schema: Validator,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let schema_value: Value =
            serde_json::from_str(CHECKPOINT_SCHEMA).context("parse checkpoint schema")?;
        let schema = validator_for(&schema_value)
            .map_err(|err| anyhow!("invalid checkpoint schema: {err}"))?;
        Ok(Self {
            dir: dir.into(),
            schema,
        })
    }

    pub fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{workflow_id}.json"))
    }

    fn read(&self, workflow_id: &str, path: &Path) -> Result<ExecutionState, FlowError> {
        let corrupt = |reason: String| FlowError::StateCorruption {
            workflow_id: workflow_id.to_string(),
            reason,
        };
        let contents = fs::read_to_string(path).map_err(|err| {
            FlowError::store(
                format!("read checkpoint {}", path.display()),
                &anyhow!(err),
            )
        })?;
        let value: Value =
            serde_json::from_str(&contents).map_err(|err| corrupt(format!("invalid JSON: {err}")))?;
        if !self.schema.is_valid(&value) {
            let messages = self
                .schema
                .iter_errors(&value)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();
            return Err(corrupt(format!(
                "schema validation failed: {}",
                messages.join("; ")
            )));
        }
        let state: ExecutionState =
            serde_json::from_value(value).map_err(|err| corrupt(err.to_string()))?;
        if state.workflow_id != workflow_id {
            return Err(corrupt(format!(
                "file records workflow id '{}'",
                state.workflow_id
            )));
        }
        Ok(state)
    }
}

impl StateStore for FileStateStore {
    #[instrument(skip_all, fields(workflow_id = %state.workflow_id, current_step = state.current_step, status = state.status.as_str()))]
    fn save(&self, state: &ExecutionState) -> Result<()> {
        validate_id(&state.workflow_id)?;
        let path = self.path_for(&state.workflow_id);
        let mut buf = serde_json::to_string_pretty(state).context("serialize checkpoint")?;
        buf.push('\n');
        super::write_atomic(&path, &buf)
            .with_context(|| format!("write checkpoint {}", path.display()))?;
        debug!(path = %path.display(), "checkpoint written");
        Ok(())
    }

    #[instrument(skip_all, fields(workflow_id = %workflow_id))]
    fn load(&self, workflow_id: &str) -> Result<Option<ExecutionState>, FlowError> {
        validate_id(workflow_id)
            .map_err(|err| FlowError::store(format!("load checkpoint '{workflow_id}'"), &err))?;
        let path = self.path_for(workflow_id);
        if !path.exists() {
            debug!(path = %path.display(), "no checkpoint");
            return Ok(None);
        }
        let state = self.read(workflow_id, &path)?;
        debug!(current_step = state.current_step, status = state.status.as_str(), "checkpoint loaded");
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ActivityKind, ActivityRecord, FlowStatus, GateResult};
    use crate::core::vars::VariableEnvironment;
    use serde_json::json;

    fn sample_state(id: &str) -> ExecutionState {
        let variables: VariableEnvironment =
            serde_json::from_value(json!({"env": "staging", "nested": {"k": [1, 2.5]}}))
                .expect("vars");
        let mut state = ExecutionState::new(id, "wf", "ab".repeat(32), variables);
        state.current_step = 2;
        state.pending_jump = Some(1);
        state.record(ActivityRecord::new(1, ActivityKind::StepCompleted, "analyze"));
        state.gates.insert(
            2,
            GateResult {
                score: 91.5,
                passed: true,
                gaps: Vec::new(),
                threshold: 85.0,
            },
        );
        state
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path()).expect("store");
        let mut state = sample_state("story-1");
        state.variables.set("ratio", 1.0715660391465826e-75);
        store.save(&state).expect("save");
        let loaded = store.load("story-1").expect("load").expect("present");
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path()).expect("store");
        assert!(store.load("nothing").expect("load").is_none());
    }

    #[test]
    fn unreadable_or_off_schema_checkpoints_are_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path()).expect("store");

        fs::write(store.path_for("broken"), "{not json").expect("write");
        assert!(matches!(
            store.load("broken"),
            Err(FlowError::StateCorruption { .. })
        ));

        let mut value = serde_json::to_value(sample_state("bad-status")).expect("value");
        value["status"] = json!("sleeping");
        fs::write(store.path_for("bad-status"), value.to_string()).expect("write");
        match store.load("bad-status") {
            Err(FlowError::StateCorruption { reason, .. }) => {
                assert!(reason.contains("schema validation failed"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn checkpoint_under_wrong_name_is_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path()).expect("store");
        store.save(&sample_state("one")).expect("save");
        fs::rename(store.path_for("one"), store.path_for("two")).expect("rename");
        assert!(matches!(
            store.load("two"),
            Err(FlowError::StateCorruption { .. })
        ));
    }

    #[test]
    fn rejects_unsafe_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path()).expect("store");
        let mut state = sample_state("ok");
        state.workflow_id = "../escape".to_string();
        assert!(store.save(&state).is_err());
        assert!(matches!(store.load("../escape"), Err(FlowError::Store { .. })));
    }

    #[test]
    fn saves_overwrite_previous_checkpoint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path()).expect("store");
        let mut state = sample_state("again");
        store.save(&state).expect("save");
        state.status = FlowStatus::Completed;
        state.current_step = 3;
        store.save(&state).expect("save");
        let loaded = store.load("again").expect("load").expect("present");
        assert_eq!(loaded.status, FlowStatus::Completed);
        assert_eq!(loaded.current_step, 3);
    }
}
