//! Gated checkpoints: scored validation that either passes or blocks with an escalation.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::GateResult;
use crate::core::vars::{VariableEnvironment, stringify};
use crate::io::escalation::{Escalation, EscalationSink};
use crate::io::init::FlowPaths;
use crate::io::workspace::Workspace;

/// What a validator reports for one gate.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    /// 0-100.
    pub score: f64,
    pub required: Vec<String>,
    pub satisfied: Vec<String>,
}

/// Where a gate runs.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub workflow_id: &'a str,
    pub step: u32,
    pub gate: &'a str,
    pub goal: &'a str,
    pub variables: &'a VariableEnvironment,
}

impl GateInput<'_> {
    /// Most recent agent output, if any.
    pub fn latest_output(&self) -> Option<String> {
        self.variables.resolve("last_response").map(stringify)
    }
}

pub trait Validator {
    fn validate(&self, input: &GateInput<'_>) -> Result<Validation>;
}

/// Validators by gate name, with an optional catch-all.
#[derive(Default)]
pub struct Validators<'a> {
    by_name: BTreeMap<String, &'a dyn Validator>,
    fallback: Option<&'a dyn Validator>,
}

impl<'a> Validators<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, gate: impl Into<String>, validator: &'a dyn Validator) -> Self {
        self.by_name.insert(gate.into(), validator);
        self
    }

    pub fn with_fallback(mut self, validator: &'a dyn Validator) -> Self {
        self.fallback = Some(validator);
        self
    }

    pub fn get(&self, gate: &str) -> Option<&'a dyn Validator> {
        self.by_name.get(gate).copied().or(self.fallback)
    }
}

/// Result of enforcing a gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Passed(GateResult),
    Blocked {
        result: GateResult,
        escalation_id: String,
        /// Gap report path relative to the workspace root.
        report_path: String,
    },
}

/// Invoke the validator once and score it against `threshold`.
#[instrument(skip_all, fields(gate = input.gate, step = input.step, threshold = threshold))]
pub fn run_gate(
    validator: &dyn Validator,
    input: &GateInput<'_>,
    threshold: f64,
) -> Result<GateResult> {
    let validation = validator
        .validate(input)
        .with_context(|| format!("validator for gate '{}'", input.gate))?;
    let gaps = validation
        .required
        .iter()
        .filter(|req| !validation.satisfied.contains(req))
        .cloned()
        .collect();
    let result = GateResult {
        score: validation.score,
        passed: validation.score >= threshold,
        gaps,
        threshold,
    };
    info!(score = result.score, passed = result.passed, "gate scored");
    Ok(result)
}

/// Pass through a passing result; otherwise write the gap report and raise an escalation.
pub fn enforce(
    result: GateResult,
    input: &GateInput<'_>,
    workspace: &dyn Workspace,
    escalations: &dyn EscalationSink,
) -> Result<GateOutcome> {
    if result.passed {
        return Ok(GateOutcome::Passed(result));
    }

    let report_path = FlowPaths::gap_report_rel(input.workflow_id, input.step, input.gate);
    workspace
        .write(&report_path, &gap_report(input, &result))
        .context("write gap report")?;

    let escalation = Escalation {
        workflow_id: input.workflow_id.to_string(),
        step: input.step,
        question: format!(
            "Gate '{}' blocked step {} ({}). Resolve the gaps and resume.",
            input.gate, input.step, input.goal
        ),
        reasoning: format!(
            "score {:.1} is below threshold {:.1}; gaps: {}",
            result.score,
            result.threshold,
            if result.gaps.is_empty() {
                "none itemized".to_string()
            } else {
                result.gaps.join("; ")
            }
        ),
        confidence: (result.score / 100.0).clamp(0.0, 1.0),
        context: BTreeMap::from([
            ("gate".to_string(), input.gate.to_string()),
            ("gap_report".to_string(), report_path.clone()),
            ("score".to_string(), format!("{:.1}", result.score)),
            ("threshold".to_string(), format!("{:.1}", result.threshold)),
        ]),
    };
    let escalation_id = escalations
        .raise(&escalation)
        .context("raise gate escalation")?;
    warn!(gate = input.gate, step = input.step, escalation_id = %escalation_id, "gate blocked");

    Ok(GateOutcome::Blocked {
        result,
        escalation_id,
        report_path,
    })
}

/// Human-readable comparison of what the gate required and what it found.
pub fn gap_report(input: &GateInput<'_>, result: &GateResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Gate report: {} (step {})", input.gate, input.step);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Workflow: {}", input.workflow_id);
    let _ = writeln!(out, "- Goal: {}", input.goal);
    let _ = writeln!(
        out,
        "- Score: {:.1} (threshold {:.1}) {}",
        result.score,
        result.threshold,
        if result.passed { "PASSED" } else { "BLOCKED" }
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "## Gaps");
    let _ = writeln!(out);
    if result.gaps.is_empty() {
        let _ = writeln!(
            out,
            "No unmet requirement was itemized; the overall score is below the threshold."
        );
    }
    for gap in &result.gaps {
        let _ = writeln!(out, "- [ ] {gap}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::workspace::DirWorkspace;
    use crate::test_support::{FixedValidator, RecordingEscalationSink};

    fn input<'a>(vars: &'a VariableEnvironment) -> GateInput<'a> {
        GateInput {
            workflow_id: "story-1",
            step: 3,
            gate: "requirements",
            goal: "Requirements gate",
            variables: vars,
        }
    }

    #[test]
    fn low_score_fails_with_gaps() {
        let vars = VariableEnvironment::new();
        let validator = FixedValidator::new(70.0)
            .requiring(&["acceptance criteria", "edge cases"])
            .satisfying(&["acceptance criteria"]);
        let result = run_gate(&validator, &input(&vars), 85.0).expect("gate");
        assert!(!result.passed);
        assert_eq!(result.gaps, vec!["edge cases".to_string()]);
        assert_eq!(result.threshold, 85.0);
        assert_eq!(validator.calls(), 1);
    }

    #[test]
    fn score_at_threshold_passes() {
        let vars = VariableEnvironment::new();
        let validator = FixedValidator::new(85.0);
        assert!(run_gate(&validator, &input(&vars), 85.0).expect("gate").passed);
    }

    #[test]
    fn blocked_gate_writes_report_and_raises_one_escalation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = DirWorkspace::new(temp.path());
        let sink = RecordingEscalationSink::default();
        let vars = VariableEnvironment::new();
        let result = GateResult {
            score: 70.0,
            passed: false,
            gaps: vec!["edge cases".to_string()],
            threshold: 85.0,
        };

        let outcome = enforce(result, &input(&vars), &ws, &sink).expect("enforce");
        let GateOutcome::Blocked {
            escalation_id,
            report_path,
            ..
        } = outcome
        else {
            panic!("expected block");
        };
        assert_eq!(report_path, ".devflow/gates/story-1/step-3-requirements.md");
        let report = ws.read(&report_path).expect("report");
        assert!(report.contains("- [ ] edge cases"));
        assert!(report.contains("BLOCKED"));

        let raised = sink.raised();
        assert_eq!(raised.len(), 1);
        assert_eq!(escalation_id, "esc-1");
        assert!(raised[0].reasoning.contains("70.0"));
        assert_eq!(raised[0].context["gap_report"], report_path);
    }

    #[test]
    fn passing_gate_has_no_side_effects() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = DirWorkspace::new(temp.path());
        let sink = RecordingEscalationSink::default();
        let vars = VariableEnvironment::new();
        let result = GateResult {
            score: 90.0,
            passed: true,
            gaps: Vec::new(),
            threshold: 85.0,
        };
        let outcome = enforce(result.clone(), &input(&vars), &ws, &sink).expect("enforce");
        assert_eq!(outcome, GateOutcome::Passed(result));
        assert!(sink.raised().is_empty());
        assert!(!temp.path().join(".devflow").exists());
    }

    #[test]
    fn registry_prefers_named_validator() {
        let named = FixedValidator::new(10.0);
        let fallback = FixedValidator::new(99.0);
        let validators = Validators::new().with("review", &named).with_fallback(&fallback);
        let vars = VariableEnvironment::new();
        let gate_input = input(&vars);
        let score = |gate: &str| {
            validators
                .get(gate)
                .expect("validator")
                .validate(&gate_input)
                .expect("validate")
                .score
        };
        assert_eq!(score("review"), 10.0);
        assert_eq!(score("other"), 99.0);
        assert!(Validators::new().get("review").is_none());
    }
}
