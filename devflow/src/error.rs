//! Error taxonomy for workflow execution.
//!
//! Collaborators report failures as `anyhow::Error`; the sequencer folds them
//! into [`FlowError`] so callers can match on the category structurally.
//! Malformed conditions are not errors: they are logged and evaluate to false.

use thiserror::Error;

/// Workflow execution errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FlowError {
    /// Malformed workflow definition. Never retried.
    #[error("parse error{}: {message}", line_suffix(*line))]
    Parse {
        /// 1-based line in the definition source, when known.
        line: Option<usize>,
        message: String,
    },

    /// A `{{placeholder}}` without a default referenced an unbound variable.
    #[error(
        "undefined variable '{name}' (known variables: {}); bind it with --var {name}=<value> or add a default with {{{{{name}|<default>}}}}",
        known_list(known)
    )]
    UndefinedVariable { name: String, known: Vec<String> },

    /// A jump named a step that does not exist in the definition.
    #[error("invalid jump target {target} (valid steps: {valid:?})")]
    InvalidJumpTarget { target: u32, valid: Vec<u32> },

    /// An external call kept failing after the retry policy gave up.
    #[error("{action} failed after {attempts} attempt(s): {cause}")]
    ActionFailure {
        action: String,
        attempts: u32,
        cause: String,
    },

    /// A gated checkpoint scored below its threshold. Always escalated first.
    #[error(
        "gate '{gate}' blocked step {step}: score {score:.1} below threshold {threshold:.1} (escalation {escalation_id}, gaps: {})",
        gaps.join("; ")
    )]
    GateFailure {
        step: u32,
        gate: String,
        score: f64,
        threshold: f64,
        gaps: Vec<String>,
        escalation_id: String,
    },

    /// Checkpoint unreadable or not matching the checkpoint schema.
    #[error("checkpoint for '{workflow_id}' is corrupt: {reason}")]
    StateCorruption { workflow_id: String, reason: String },

    /// Checkpoint belongs to a different workflow definition.
    #[error("checkpoint for '{workflow_id}' was written by {found} but resuming {expected}")]
    ResumeMismatch {
        workflow_id: String,
        expected: String,
        found: String,
    },

    #[error("workflow '{workflow_id}' already completed")]
    AlreadyCompleted { workflow_id: String },

    #[error("no checkpoint found for workflow '{workflow_id}'")]
    CheckpointNotFound { workflow_id: String },

    /// Cooperative cancellation honored at a step boundary.
    #[error("workflow '{workflow_id}' cancelled before step {step}")]
    Cancelled { workflow_id: String, step: u32 },

    #[error("exceeded {limit} step executions (jump cycle?)")]
    TransitionLimitExceeded { limit: u32 },

    #[error("sub-workflow nesting deeper than {limit}")]
    SubworkflowDepthExceeded { limit: u32 },

    /// State store or workspace failure outside any action.
    #[error("{context}: {cause}")]
    Store { context: String, cause: String },

    /// Failure inside a step body, annotated with where it happened.
    #[error("step {step} ({goal}) failed near \"{excerpt}\": {source}")]
    Step {
        step: u32,
        goal: String,
        excerpt: String,
        #[source]
        source: Box<FlowError>,
    },
}

impl FlowError {
    pub fn parse(line: Option<usize>, message: impl Into<String>) -> Self {
        FlowError::Parse {
            line,
            message: message.into(),
        }
    }

    pub fn store(context: impl Into<String>, err: &anyhow::Error) -> Self {
        FlowError::Store {
            context: context.into(),
            cause: format!("{err:#}"),
        }
    }

    /// The innermost error, looking through `Step` wrappers.
    pub fn root_cause(&self) -> &FlowError {
        match self {
            FlowError::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// True when the run halted because a gated checkpoint failed.
    pub fn is_blocking_gate(&self) -> bool {
        matches!(self.root_cause(), FlowError::GateFailure { .. })
    }
}

fn line_suffix(line: Option<usize>) -> String {
    match line {
        Some(line) => format!(" at line {line}"),
        None => String::new(),
    }
}

fn known_list(known: &[String]) -> String {
    if known.is_empty() {
        "none".to_string()
    } else {
        known.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_variable_lists_known_names_and_hint() {
        let err = FlowError::UndefinedVariable {
            name: "story".to_string(),
            known: vec!["date".to_string(), "project-root".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("'story'"));
        assert!(msg.contains("date, project-root"));
        assert!(msg.contains("--var story=<value>"));
        assert!(msg.contains("{{story|<default>}}"));
    }

    #[test]
    fn root_cause_sees_through_step_wrappers() {
        let err = FlowError::Step {
            step: 2,
            goal: "review".to_string(),
            excerpt: "<goto step=\"9\"/>".to_string(),
            source: Box::new(FlowError::GateFailure {
                step: 2,
                gate: "review".to_string(),
                score: 70.0,
                threshold: 85.0,
                gaps: vec!["tests".to_string()],
                escalation_id: "esc-1".to_string(),
            }),
        };
        assert!(err.is_blocking_gate());
        assert!(err.to_string().starts_with("step 2 (review) failed"));
    }

    #[test]
    fn parse_error_mentions_line() {
        let err = FlowError::parse(Some(4), "bad attribute");
        assert_eq!(err.to_string(), "parse error at line 4: bad attribute");
    }
}
