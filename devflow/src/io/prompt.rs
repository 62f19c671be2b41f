//! Prompt rendering for agent invocations.

use std::collections::BTreeMap;

use anyhow::Result;
use minijinja::{Environment, context};

const AGENT_TASK_TEMPLATE: &str = include_str!("prompts/agent_task.md");
const GATE_REVIEW_TEMPLATE: &str = include_str!("prompts/gate_review.md");

/// JSON shape agents are asked to answer with.
pub const RESPONSE_FORMAT: &str = r#"Reply with a single JSON object: {"content": "<your answer>", "confidence": <0.0-1.0>}"#;

/// JSON shape gate reviewers are asked to answer with.
pub const VERDICT_FORMAT: &str = r#"Reply with a single JSON object: {"score": <0-100>, "required": ["..."], "satisfied": ["..."]}"#;

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
        env.add_template("agent_task", AGENT_TASK_TEMPLATE)
            .expect("agent task template should be valid");
        env.add_template("gate_review", GATE_REVIEW_TEMPLATE)
            .expect("gate review template should be valid");
        Self { env }
    }

    /// Full stdin payload for an agent child process.
    pub fn render_task(&self, task: &str, context: &BTreeMap<String, String>) -> Result<String> {
        let template = self.env.get_template("agent_task")?;
        let rendered = template.render(context! {
            task => task.trim(),
            context => context,
            response_format => RESPONSE_FORMAT,
        })?;
        Ok(rendered)
    }

    /// Task text asking the agent to score a gated step.
    pub fn render_gate_review(
        &self,
        gate: &str,
        step: u32,
        goal: &str,
        latest: Option<&str>,
    ) -> Result<String> {
        let template = self.env.get_template("gate_review")?;
        let rendered = template.render(context! {
            gate => gate,
            step => step,
            goal => goal,
            latest => latest.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(format!("{rendered}\n{VERDICT_FORMAT}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_prompt_lists_context_in_key_order() {
        let engine = PromptEngine::new();
        let mut ctx = BTreeMap::new();
        ctx.insert("workflow-id".to_string(), "wf-1".to_string());
        ctx.insert("step".to_string(), "2".to_string());
        let rendered = engine.render_task("  Do the thing  ", &ctx).expect("render");

        let step_pos = rendered.find("- step: 2").expect("step line");
        let id_pos = rendered.find("- workflow-id: wf-1").expect("id line");
        assert!(step_pos < id_pos);
        assert!(rendered.contains("<task>\nDo the thing\n</task>"));
        assert!(rendered.contains(RESPONSE_FORMAT));
    }

    #[test]
    fn gate_review_omits_empty_latest_output() {
        let engine = PromptEngine::new();
        let without = engine
            .render_gate_review("review", 8, "Review", Some("   "))
            .expect("render");
        assert!(!without.contains("<latest_output>"));
        assert!(without.ends_with(VERDICT_FORMAT));

        let with = engine
            .render_gate_review("review", 8, "Review", Some("diff here"))
            .expect("render");
        assert!(with.contains("<latest_output>\ndiff here\n</latest_output>"));
        assert!(with.contains("\"review\" quality gate of step 8"));
    }
}
