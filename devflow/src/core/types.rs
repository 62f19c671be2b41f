//! Shared deterministic types for the workflow core.
//!
//! These types define stable contracts between the sequencer, its
//! collaborators, and persisted checkpoints. They must not depend on I/O.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a workflow instance as recorded in its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Running,
    /// Persisted but not executing; left only through an explicit resume.
    Paused,
    Completed,
    Error,
}

impl FlowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowStatus::Running => "running",
            FlowStatus::Paused => "paused",
            FlowStatus::Completed => "completed",
            FlowStatus::Error => "error",
        }
    }
}

/// Kind of event captured in a checkpoint's activity history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    StepCompleted,
    StepSkipped,
    OptionalSkipped,
    AgentInvoked,
    Emitted,
    TemplateRendered,
    Elicited,
    Jumped,
    SubworkflowCompleted,
    GatePassed,
    GateBlocked,
    Escalated,
    Cancelled,
    Failed,
}

/// One entry of the durable activity history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub at: DateTime<Utc>,
    pub step: u32,
    pub kind: ActivityKind,
    pub detail: String,
}

impl ActivityRecord {
    pub fn new(step: u32, kind: ActivityKind, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            step,
            kind,
            detail: detail.into(),
        }
    }
}

/// Outcome of a scored validation at a gated checkpoint.
///
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub score: f64,
    pub passed: bool,
    /// Required conditions the validator did not find satisfied.
    pub gaps: Vec<String>,
    pub threshold: f64,
}

/// Diagnostic record of one attempt made by the retry policy. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Error text when the attempt failed.
    pub error: Option<String>,
    /// Delay slept before this attempt.
    pub delay_ms: u64,
}

/// Opaque response returned by an agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: String,
    /// Self-reported confidence in `[0.0, 1.0]`.
    pub confidence: f64,
}

/// Validate that an id is safe for use as a file name component.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id.contains('/') {
        return Err(anyhow!("id must not contain '/'"));
    }
    if id.starts_with('.') {
        return Err(anyhow!("id must not start with '.'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}
