//! Built-in nine-step story pipeline and its agent-backed gate reviewer.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::types::AgentResponse;
use crate::error::FlowError;
use crate::gate::{GateInput, Validation, Validator};
use crate::io::agent::{Agent, AgentRequest};
use crate::io::definition::{LoadedDefinition, parse_source, validate_id};
use crate::io::prompt::PromptEngine;
use crate::retry::{RetryPolicy, Sleeper};

const STORY_SOURCE: &str = include_str!("workflows/story.md");

/// Gates the story pipeline enforces, in order.
pub const STORY_GATES: [&str; 3] = ["requirements", "architecture", "review"];

/// Parse the embedded story definition and check its gates are mandatory.
pub fn story_definition() -> Result<LoadedDefinition, FlowError> {
    let loaded = parse_source(STORY_SOURCE, "story")?;
    ensure_gates_mandatory(&loaded)?;
    Ok(loaded)
}

/// Reject gated steps that could be skipped by fast mode or a condition.
pub fn ensure_gates_mandatory(loaded: &LoadedDefinition) -> Result<(), FlowError> {
    for step in &loaded.definition.steps {
        let Some(gate) = &step.gate else {
            continue;
        };
        if step.optional {
            return Err(FlowError::parse(
                None,
                format!("gate '{}' on step {} must not be optional", gate.name, step.number),
            ));
        }
        if step.condition.is_some() {
            return Err(FlowError::parse(
                None,
                format!("gate '{}' on step {} must not be conditional", gate.name, step.number),
            ));
        }
    }
    Ok(())
}

/// Checkpoint id for a story.
pub fn story_workflow_id(story_id: &str) -> Result<String, FlowError> {
    let id = format!("story-{story_id}");
    validate_id(&id).map_err(|err| FlowError::store(format!("story '{story_id}'"), &err))?;
    Ok(id)
}

pub fn story_inputs(story_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("story-id".to_string(), story_id.to_string())])
}

/// Gate reviewer that asks the agent for a scored verdict.
///
/// Review calls go through the same retry policy as step actions.
pub struct AgentValidator<'a> {
    agent: &'a dyn Agent,
    retry: RetryPolicy,
    sleeper: &'a dyn Sleeper,
    prompts: PromptEngine,
}

impl<'a> AgentValidator<'a> {
    pub fn new(agent: &'a dyn Agent, retry: RetryPolicy, sleeper: &'a dyn Sleeper) -> Self {
        Self {
            agent,
            retry,
            sleeper,
            prompts: PromptEngine::new(),
        }
    }
}

impl Validator for AgentValidator<'_> {
    #[instrument(skip_all, fields(gate = input.gate, step = input.step))]
    fn validate(&self, input: &GateInput<'_>) -> Result<Validation> {
        let latest = input.latest_output();
        let task = self
            .prompts
            .render_gate_review(input.gate, input.step, input.goal, latest.as_deref())
            .context("render gate review")?;
        let request = AgentRequest {
            task,
            context: BTreeMap::from([
                ("gate".to_string(), input.gate.to_string()),
                ("step".to_string(), input.step.to_string()),
                ("workflow-id".to_string(), input.workflow_id.to_string()),
            ]),
        };
        let (result, attempts) = self
            .retry
            .run(self.sleeper, |_| self.agent.invoke(&request));
        debug!(attempts = attempts.len(), "review call finished");
        let response = result.map_err(|exhausted| {
            exhausted.last_error.context(format!(
                "review for gate '{}' failed after {} attempt(s)",
                input.gate, exhausted.attempts
            ))
        })?;
        Ok(parse_verdict(&response))
    }
}

#[derive(Debug, Deserialize)]
struct Verdict {
    score: f64,
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    satisfied: Vec<String>,
}

/// Read a `{score, required, satisfied}` verdict from the agent's answer.
///
/// The object may be surrounded by prose. Without one, the score is the
/// agent's confidence scaled to 0-100.
pub fn parse_verdict(response: &AgentResponse) -> Validation {
    let content = response.content.trim();
    let candidate = match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => content,
    };
    match serde_json::from_str::<Verdict>(candidate) {
        Ok(verdict) => Validation {
            score: verdict.score.clamp(0.0, 100.0),
            required: verdict.required,
            satisfied: verdict.satisfied,
        },
        Err(err) => {
            debug!(err = %err, "no verdict object; scoring from confidence");
            Validation {
                score: (response.confidence * 100.0).clamp(0.0, 100.0),
                required: Vec::new(),
                satisfied: Vec::new(),
            }
        }
    }
}
