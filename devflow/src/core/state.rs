//! Persisted execution state (the checkpoint) and resume positioning.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::step::WorkflowDefinition;
use crate::core::types::{ActivityRecord, FlowStatus, GateResult};
use crate::core::vars::VariableEnvironment;
use crate::error::FlowError;

/// Current checkpoint layout version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Snapshot of one workflow instance's progress.
///
/// `current_step` is the number of the last successfully completed step
/// (0 before any step has run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub schema_version: u32,
    pub workflow_id: String,
    pub workflow_name: String,
    /// SHA-256 of the definition source the checkpoint was written against.
    pub definition_digest: String,
    pub current_step: u32,
    pub status: FlowStatus,
    pub variables: VariableEnvironment,
    pub history: Vec<ActivityRecord>,
    /// Gate results keyed by step number.
    pub gates: BTreeMap<u32, GateResult>,
    /// Set when the step recorded in `current_step` ended with a jump.
    pub pending_jump: Option<u32>,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        definition_digest: impl Into<String>,
        variables: VariableEnvironment,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            definition_digest: definition_digest.into(),
            current_step: 0,
            status: FlowStatus::Running,
            variables,
            history: Vec::new(),
            gates: BTreeMap::new(),
            pending_jump: None,
            start_time: now,
            last_update: now,
        }
    }

    pub fn record(&mut self, record: ActivityRecord) {
        self.history.push(record);
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }

    /// Fail unless this checkpoint was written for `name` at `digest`.
    pub fn ensure_identity(&self, name: &str, digest: &str) -> Result<(), FlowError> {
        if self.workflow_name == name && self.definition_digest == digest {
            return Ok(());
        }
        Err(FlowError::ResumeMismatch {
            workflow_id: self.workflow_id.clone(),
            expected: identity(name, digest),
            found: identity(&self.workflow_name, &self.definition_digest),
        })
    }

    /// Index into `def.steps` where execution continues.
    ///
    /// A pending jump wins; otherwise execution continues after `current_step`.
    /// Equal to `def.steps.len()` when every step has completed.
    pub fn resume_index(&self, def: &WorkflowDefinition) -> Result<usize, FlowError> {
        if let Some(target) = self.pending_jump {
            return def.index_of(target).ok_or_else(|| {
                self.corrupt(format!(
                    "pending jump target {target} is not a step of '{}'",
                    def.name
                ))
            });
        }
        if self.current_step == 0 {
            return Ok(0);
        }
        def.index_of(self.current_step)
            .map(|index| index + 1)
            .ok_or_else(|| {
                self.corrupt(format!(
                    "current step {} is not a step of '{}'",
                    self.current_step, def.name
                ))
            })
    }

    fn corrupt(&self, reason: String) -> FlowError {
        FlowError::StateCorruption {
            workflow_id: self.workflow_id.clone(),
            reason,
        }
    }
}

fn identity(name: &str, digest: &str) -> String {
    let short = digest.get(..12).unwrap_or(digest);
    format!("'{name}' ({short})")
}
