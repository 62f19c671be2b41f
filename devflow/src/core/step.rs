//! Workflow step model: definitions, steps, actions, and checks.

use std::cell::OnceCell;
use std::collections::BTreeMap;

use crate::core::markup::parse_body;
use crate::error::FlowError;

/// An immutable, parsed workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    /// Steps in declaration order; numbers are contiguous from 1.
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    /// Index of the step numbered `number`, if any.
    pub fn index_of(&self, number: u32) -> Option<usize> {
        self.steps.iter().position(|step| step.number == number)
    }

    pub fn step_numbers(&self) -> Vec<u32> {
        self.steps.iter().map(|step| step.number).collect()
    }

    /// Force every step body to parse, collecting all failures.
    pub fn validate_all(&self) -> Vec<FlowError> {
        self.steps
            .iter()
            .filter_map(|step| step.body().err())
            .collect()
    }
}

/// Scored validation attached to a step.
#[derive(Debug, Clone, PartialEq)]
pub struct GateSpec {
    /// Validator name, resolved through the validator registry.
    pub name: String,
    /// Explicit threshold; falls back to configuration when absent.
    pub threshold: Option<f64>,
}

/// One numbered unit of a workflow.
#[derive(Debug, Clone)]
pub struct Step {
    pub number: u32,
    pub goal: String,
    pub raw_content: String,
    pub optional: bool,
    pub condition: Option<String>,
    pub gate: Option<GateSpec>,
    /// Line of `raw_content`'s first character in the definition source.
    pub content_line: usize,
    body: OnceCell<StepBody>,
}

impl Step {
    pub fn new(number: u32, goal: impl Into<String>, raw_content: impl Into<String>) -> Self {
        Self {
            number,
            goal: goal.into(),
            raw_content: raw_content.into(),
            optional: false,
            condition: None,
            gate: None,
            content_line: 1,
            body: OnceCell::new(),
        }
    }

    /// Actions and checks, parsed from `raw_content` on first use and cached.
    pub fn body(&self) -> Result<&StepBody, FlowError> {
        if let Some(body) = self.body.get() {
            return Ok(body);
        }
        let parsed = parse_body(&self.raw_content, self.content_line)?;
        Ok(self.body.get_or_init(|| parsed))
    }

    pub fn is_parsed(&self) -> bool {
        self.body.get().is_some()
    }

    /// Short single-line excerpt of the step content for error messages.
    pub fn excerpt(&self) -> String {
        excerpt(&self.raw_content)
    }
}

/// Parsed contents of a step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepBody {
    pub actions: Vec<Action>,
    pub checks: Vec<Check>,
}

/// A conditional group of actions.
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub condition: String,
    pub actions: Vec<Action>,
}

/// A single dispatchable operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub condition: Option<String>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Action kinds with their required fields.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    /// Free text inside a step; logged only.
    Note { text: String },
    /// Instruction sent to the agent.
    Prompt { instruction: String },
    /// Message recorded in the activity history.
    Emit { text: String },
    /// Content written to a workspace file.
    RenderTemplate { file: String, content: String },
    /// Question answered by the agent (or skipped in fast mode if optional).
    Elicit { question: String, required: bool },
    Jump { step: u32 },
    InvokeSubworkflow {
        path: String,
        inputs: BTreeMap<String, String>,
    },
    InvokeTask { path: String },
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Note { .. } => "note",
            ActionKind::Prompt { .. } => "action",
            ActionKind::Emit { .. } => "output",
            ActionKind::RenderTemplate { .. } => "template-output",
            ActionKind::Elicit { required: false, .. } => "ask",
            ActionKind::Elicit { required: true, .. } => "elicit-required",
            ActionKind::Jump { .. } => "goto",
            ActionKind::InvokeSubworkflow { .. } => "invoke-workflow",
            ActionKind::InvokeTask { .. } => "invoke-task",
        }
    }
}

pub(crate) fn excerpt(text: &str) -> String {
    const MAX_CHARS: usize = 80;
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(MAX_CHARS).collect();
    format!("{cut}...")
}
