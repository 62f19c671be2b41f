//! Resumable step interpreter.
//!
//! Walks a [`WorkflowDefinition`] step by step over one instance's variables,
//! dispatching actions to collaborators and checkpointing after each step.
//! Control flow covers sequential advance, conditional skip, jumps (forward
//! or backward), nested sub-workflows, gated checkpoints, and cooperative
//! cancellation at step boundaries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, error, info, info_span, instrument, warn};

use crate::core::condition::evaluate;
use crate::core::state::ExecutionState;
use crate::core::step::{Action, ActionKind, Step, WorkflowDefinition, excerpt};
use crate::core::types::{ActivityKind, ActivityRecord, AgentResponse, FlowStatus};
use crate::core::vars::{VariableEnvironment, stringify};
use crate::error::FlowError;
use crate::gate::{GateInput, GateOutcome, Validators, enforce, run_gate};
use crate::io::agent::{Agent, AgentRequest};
use crate::io::config::FlowConfig;
use crate::io::definition::{LoadedDefinition, child_workflow_id, file_stem, parse_source, validate_id};
use crate::io::escalation::{Escalation, EscalationSink};
use crate::io::state_store::StateStore;
use crate::io::workspace::{Workspace, WorkspaceProbe};
use crate::retry::{RetryPolicy, Sleeper};

/// External capabilities a run depends on.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub agent: &'a dyn Agent,
    pub store: &'a dyn StateStore,
    pub escalations: &'a dyn EscalationSink,
    pub workspace: &'a dyn Workspace,
    pub validators: &'a Validators<'a>,
    pub sleeper: &'a dyn Sleeper,
}

/// Cooperative cancellation flag, honored at the top of each step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the loop does after a step.
enum StepFlow {
    Next,
    /// Continue at this index of `def.steps`.
    Jump(usize),
}

/// What a step body does after an action.
enum ActionFlow {
    Continue,
    Jump(u32),
}

pub struct Sequencer<'a> {
    collab: Collaborators<'a>,
    config: &'a FlowConfig,
    retry: RetryPolicy,
    fast: bool,
    cancel: CancelToken,
    depth: u32,
}

impl<'a> Sequencer<'a> {
    pub fn new(collab: Collaborators<'a>, config: &'a FlowConfig) -> Self {
        Self {
            collab,
            config,
            retry: RetryPolicy::from_config(&config.retry),
            fast: config.fast_mode,
            cancel: CancelToken::new(),
            depth: 0,
        }
    }

    /// Skip optional steps and optional elicitations.
    pub fn fast(mut self, fast: bool) -> Self {
        self.fast = fast;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start a new instance. Refuses to overwrite an existing checkpoint.
    #[instrument(skip_all, fields(workflow_id = %workflow_id, workflow = %loaded.definition.name))]
    pub fn start(
        &self,
        loaded: &LoadedDefinition,
        workflow_id: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<ExecutionState, FlowError> {
        validate_id(workflow_id)
            .map_err(|err| FlowError::store(format!("start '{workflow_id}'"), &err))?;
        if self.collab.store.load(workflow_id)?.is_some() {
            return Err(FlowError::Store {
                context: format!("start '{workflow_id}'"),
                cause: "a checkpoint already exists; resume it instead".to_string(),
            });
        }
        let mut vars = VariableEnvironment::new();
        vars.set(
            "project-root",
            self.collab.workspace.root().display().to_string(),
        );
        vars.set("date", Utc::now().format("%Y-%m-%d").to_string());
        let vars = vars.merged_with(inputs);
        self.run_fresh(loaded, workflow_id, vars)
    }

    /// Continue an instance from its checkpoint.
    #[instrument(skip_all, fields(workflow_id = %workflow_id, workflow = %loaded.definition.name))]
    pub fn resume(
        &self,
        loaded: &LoadedDefinition,
        workflow_id: &str,
    ) -> Result<ExecutionState, FlowError> {
        let mut state =
            self.collab
                .store
                .load(workflow_id)?
                .ok_or_else(|| FlowError::CheckpointNotFound {
                    workflow_id: workflow_id.to_string(),
                })?;
        if state.status == FlowStatus::Completed {
            return Err(FlowError::AlreadyCompleted {
                workflow_id: workflow_id.to_string(),
            });
        }
        state.ensure_identity(&loaded.definition.name, &loaded.digest)?;
        let index = state.resume_index(&loaded.definition)?;
        info!(
            from_status = state.status.as_str(),
            current_step = state.current_step,
            pending_jump = ?state.pending_jump,
            "resuming"
        );
        state.status = FlowStatus::Running;
        self.drive(&loaded.definition, state, index)
    }

    fn run_fresh(
        &self,
        loaded: &LoadedDefinition,
        workflow_id: &str,
        mut vars: VariableEnvironment,
    ) -> Result<ExecutionState, FlowError> {
        let def = &loaded.definition;
        vars.set("workflow-id", workflow_id);
        vars.set("workflow-name", def.name.as_str());
        let mut state = ExecutionState::new(workflow_id, &def.name, &loaded.digest, vars);
        self.checkpoint(&mut state)?;
        info!(steps = def.steps.len(), depth = self.depth, "workflow started");
        self.drive(def, state, 0)
    }

    fn drive(
        &self,
        def: &WorkflowDefinition,
        mut state: ExecutionState,
        start_index: usize,
    ) -> Result<ExecutionState, FlowError> {
        let mut index = start_index;
        let mut transitions = 0u32;

        while let Some(step) = def.steps.get(index) {
            if self.cancel.is_cancelled() {
                return Err(self.pause(&mut state, step.number));
            }
            transitions += 1;
            if transitions > self.config.limits.max_transitions {
                let err = FlowError::TransitionLimitExceeded {
                    limit: self.config.limits.max_transitions,
                };
                return Err(self.fail(&mut state, err));
            }

            match self.run_step(def, step, &mut state) {
                Ok(StepFlow::Next) => index += 1,
                Ok(StepFlow::Jump(target)) => index = target,
                Err(err) if matches!(err.root_cause(), FlowError::Cancelled { .. }) => {
                    return Err(self.pause(&mut state, step.number));
                }
                Err(err) => {
                    let wrapped = FlowError::Step {
                        step: step.number,
                        goal: step.goal.clone(),
                        excerpt: step.excerpt(),
                        source: Box::new(err),
                    };
                    return Err(self.fail(&mut state, wrapped));
                }
            }
        }

        state.status = FlowStatus::Completed;
        state.pending_jump = None;
        self.checkpoint(&mut state)?;
        info!(workflow_id = %state.workflow_id, current_step = state.current_step, "workflow completed");
        Ok(state)
    }

    fn run_step(
        &self,
        def: &WorkflowDefinition,
        step: &Step,
        state: &mut ExecutionState,
    ) -> Result<StepFlow, FlowError> {
        let span = info_span!("step", number = step.number, goal = %step.goal);
        let _guard = span.enter();
        let body = step.body()?;

        if self.fast && step.optional {
            info!("optional step skipped (fast mode)");
            state.record(ActivityRecord::new(
                step.number,
                ActivityKind::OptionalSkipped,
                step.goal.clone(),
            ));
            return Ok(StepFlow::Next);
        }

        let probe = WorkspaceProbe(self.collab.workspace);
        if let Some(condition) = &step.condition
            && !evaluate(condition, &state.variables, &probe)
        {
            info!(condition = %condition, "step skipped by condition");
            state.record(ActivityRecord::new(
                step.number,
                ActivityKind::StepSkipped,
                format!("if=\"{condition}\" was false"),
            ));
            state.current_step = step.number;
            state.pending_jump = None;
            self.checkpoint(state)?;
            return Ok(StepFlow::Next);
        }

        let mut jump = None;
        for action in &body.actions {
            if let ActionFlow::Jump(target) = self.dispatch(def, step, action, state)? {
                jump = Some(target);
                break;
            }
        }
        if jump.is_none() {
            'checks: for check in &body.checks {
                if !evaluate(&check.condition, &state.variables, &probe) {
                    debug!(condition = %check.condition, "check skipped");
                    continue;
                }
                for action in &check.actions {
                    if let ActionFlow::Jump(target) = self.dispatch(def, step, action, state)? {
                        jump = Some(target);
                        break 'checks;
                    }
                }
            }
        }

        // A blocked gate fails the step before any pending jump is taken.
        if let Some(gate) = &step.gate {
            self.run_gate_step(step, &gate.name, gate.threshold, state)?;
        }

        state.current_step = step.number;
        state.pending_jump = jump;
        state.record(ActivityRecord::new(
            step.number,
            ActivityKind::StepCompleted,
            step.goal.clone(),
        ));
        self.checkpoint(state)?;

        match jump {
            Some(target) => {
                let index = def.index_of(target).ok_or_else(|| FlowError::InvalidJumpTarget {
                    target,
                    valid: def.step_numbers(),
                })?;
                Ok(StepFlow::Jump(index))
            }
            None => Ok(StepFlow::Next),
        }
    }

    fn dispatch(
        &self,
        def: &WorkflowDefinition,
        step: &Step,
        action: &Action,
        state: &mut ExecutionState,
    ) -> Result<ActionFlow, FlowError> {
        if let Some(condition) = &action.condition
            && !evaluate(
                condition,
                &state.variables,
                &WorkspaceProbe(self.collab.workspace),
            )
        {
            debug!(action = action.kind.label(), condition = %condition, "action skipped");
            return Ok(ActionFlow::Continue);
        }

        match &action.kind {
            ActionKind::Note { text } => {
                debug!(note = %excerpt(text), "note");
            }
            ActionKind::Prompt { instruction } => {
                let task = state.variables.substitute(instruction)?;
                let response = self.call_agent(step, state, &task, "action")?;
                state.variables.set("last_response", response.content.as_str());
                state.record(ActivityRecord::new(
                    step.number,
                    ActivityKind::AgentInvoked,
                    excerpt(&task),
                ));
            }
            ActionKind::Emit { text } => {
                let message = state.variables.substitute(text)?;
                info!(step = step.number, message = %message, "output");
                state.record(ActivityRecord::new(step.number, ActivityKind::Emitted, message));
            }
            ActionKind::RenderTemplate { file, content } => {
                let path = state.variables.substitute(file)?;
                let rendered = state.variables.substitute(content)?;
                self.collab
                    .workspace
                    .write(&path, &rendered)
                    .map_err(|err| FlowError::ActionFailure {
                        action: format!("template-output {path}"),
                        attempts: 1,
                        cause: format!("{err:#}"),
                    })?;
                info!(path = %path, "template rendered");
                state.record(ActivityRecord::new(
                    step.number,
                    ActivityKind::TemplateRendered,
                    path,
                ));
            }
            ActionKind::Elicit { question, required } => {
                self.elicit(step, question, *required, state)?;
            }
            ActionKind::Jump { step: target } => {
                if def.index_of(*target).is_none() {
                    return Err(FlowError::InvalidJumpTarget {
                        target: *target,
                        valid: def.step_numbers(),
                    });
                }
                info!(from = step.number, to = *target, "jump");
                state.record(ActivityRecord::new(
                    step.number,
                    ActivityKind::Jumped,
                    format!("goto {target}"),
                ));
                return Ok(ActionFlow::Jump(*target));
            }
            ActionKind::InvokeSubworkflow { path, inputs } => {
                self.invoke_subworkflow(step, path, inputs, state)?;
            }
            ActionKind::InvokeTask { path } => {
                let path = state.variables.substitute(path)?;
                let text = self
                    .collab
                    .workspace
                    .read(&path)
                    .map_err(|err| FlowError::ActionFailure {
                        action: format!("invoke-task {path}"),
                        attempts: 1,
                        cause: format!("{err:#}"),
                    })?;
                let task = state.variables.substitute(&text)?;
                let response = self.call_agent(step, state, &task, "invoke-task")?;
                state.variables.set("last_response", response.content.as_str());
                state.record(ActivityRecord::new(
                    step.number,
                    ActivityKind::AgentInvoked,
                    format!("task {path}"),
                ));
            }
        }
        Ok(ActionFlow::Continue)
    }

    fn elicit(
        &self,
        step: &Step,
        question: &str,
        required: bool,
        state: &mut ExecutionState,
    ) -> Result<(), FlowError> {
        if self.fast && !required {
            debug!(question = %excerpt(question), "optional elicitation skipped (fast mode)");
            state.record(ActivityRecord::new(
                step.number,
                ActivityKind::OptionalSkipped,
                format!("ask: {}", excerpt(question)),
            ));
            return Ok(());
        }

        let question = if question.trim().is_empty() {
            format!(
                "Review the work for step {} ({}) and list concrete improvements.",
                step.number, step.goal
            )
        } else {
            state.variables.substitute(question)?
        };
        let label = if required { "elicit-required" } else { "ask" };
        let answer = self.call_agent(step, state, &question, label)?;
        state.variables.set("last_answer", answer.content.as_str());
        state.variables.set("last_response", answer.content.as_str());
        state.record(ActivityRecord::new(
            step.number,
            ActivityKind::Elicited,
            excerpt(&question),
        ));

        if answer.confidence < self.config.escalation.min_confidence {
            let escalation = Escalation {
                workflow_id: state.workflow_id.clone(),
                step: step.number,
                question: question.clone(),
                reasoning: format!(
                    "agent answered with confidence {:.2} (minimum {:.2})",
                    answer.confidence, self.config.escalation.min_confidence
                ),
                confidence: answer.confidence,
                context: BTreeMap::from([
                    ("answer".to_string(), answer.content.clone()),
                    ("goal".to_string(), step.goal.clone()),
                ]),
            };
            match self.collab.escalations.raise(&escalation) {
                Ok(id) => {
                    warn!(escalation_id = %id, confidence = answer.confidence, "low-confidence answer escalated");
                    state.record(ActivityRecord::new(step.number, ActivityKind::Escalated, id));
                }
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "failed to raise low-confidence escalation");
                }
            }
        }
        Ok(())
    }

    fn invoke_subworkflow(
        &self,
        step: &Step,
        path: &str,
        inputs: &BTreeMap<String, String>,
        state: &mut ExecutionState,
    ) -> Result<(), FlowError> {
        let limit = self.config.limits.max_depth;
        if self.depth + 1 > limit {
            return Err(FlowError::SubworkflowDepthExceeded { limit });
        }
        let path = state.variables.substitute(path)?;
        let mut resolved = BTreeMap::new();
        for (key, value) in inputs {
            resolved.insert(key.clone(), state.variables.substitute(value)?);
        }

        let source = self
            .collab
            .workspace
            .read(&path)
            .map_err(|err| FlowError::ActionFailure {
                action: format!("invoke-workflow {path}"),
                attempts: 1,
                cause: format!("{err:#}"),
            })?;
        let loaded = parse_source(&source, &file_stem(std::path::Path::new(&path)))?;
        let child_id = child_workflow_id(&state.workflow_id, step.number, &path);
        let child_vars = state.variables.merged_with(&resolved);

        info!(child_id = %child_id, path = %path, depth = self.depth + 1, "invoking sub-workflow");
        let child = Sequencer {
            collab: self.collab,
            config: self.config,
            retry: self.retry.clone(),
            fast: self.fast,
            cancel: self.cancel.clone(),
            depth: self.depth + 1,
        };
        let child_state = child.run_fresh(&loaded, &child_id, child_vars)?;
        state.record(ActivityRecord::new(
            step.number,
            ActivityKind::SubworkflowCompleted,
            format!("{child_id} ({} steps)", child_state.current_step),
        ));
        Ok(())
    }

    fn run_gate_step(
        &self,
        step: &Step,
        gate: &str,
        explicit_threshold: Option<f64>,
        state: &mut ExecutionState,
    ) -> Result<(), FlowError> {
        let threshold = self.config.gates.threshold_for(gate, explicit_threshold);
        let validator = self
            .collab
            .validators
            .get(gate)
            .ok_or_else(|| FlowError::ActionFailure {
                action: format!("gate {gate}"),
                attempts: 0,
                cause: "no validator registered for this gate".to_string(),
            })?;
        let workflow_id = state.workflow_id.clone();
        let input = GateInput {
            workflow_id: &workflow_id,
            step: step.number,
            gate,
            goal: &step.goal,
            variables: &state.variables,
        };
        let gate_failure = |err: anyhow::Error| FlowError::ActionFailure {
            action: format!("gate {gate}"),
            attempts: 1,
            cause: format!("{err:#}"),
        };
        let result = run_gate(validator, &input, threshold).map_err(gate_failure)?;
        let outcome = enforce(result, &input, self.collab.workspace, self.collab.escalations)
            .map_err(gate_failure)?;

        match outcome {
            GateOutcome::Passed(result) => {
                state.record(ActivityRecord::new(
                    step.number,
                    ActivityKind::GatePassed,
                    format!("{gate}: {:.1} >= {:.1}", result.score, result.threshold),
                ));
                state.gates.insert(step.number, result);
                Ok(())
            }
            GateOutcome::Blocked {
                result,
                escalation_id,
                report_path,
            } => {
                state.record(ActivityRecord::new(
                    step.number,
                    ActivityKind::GateBlocked,
                    format!(
                        "{gate}: {:.1} < {:.1}; report {report_path}",
                        result.score, result.threshold
                    ),
                ));
                state.record(ActivityRecord::new(
                    step.number,
                    ActivityKind::Escalated,
                    escalation_id.clone(),
                ));
                state.gates.insert(step.number, result.clone());
                Err(FlowError::GateFailure {
                    step: step.number,
                    gate: gate.to_string(),
                    score: result.score,
                    threshold: result.threshold,
                    gaps: result.gaps,
                    escalation_id,
                })
            }
        }
    }

    fn call_agent(
        &self,
        step: &Step,
        state: &ExecutionState,
        task: &str,
        label: &str,
    ) -> Result<AgentResponse, FlowError> {
        let request = AgentRequest {
            task: task.to_string(),
            context: BTreeMap::from([
                ("goal".to_string(), step.goal.clone()),
                ("step".to_string(), step.number.to_string()),
                ("workflow-id".to_string(), state.workflow_id.clone()),
                ("workflow-name".to_string(), state.workflow_name.clone()),
            ]),
        };
        let (result, attempts) = self
            .retry
            .run(self.collab.sleeper, |_| self.collab.agent.invoke(&request));
        debug!(label, attempts = attempts.len(), "agent call finished");
        result.map_err(|exhausted| FlowError::ActionFailure {
            action: label.to_string(),
            attempts: exhausted.attempts,
            cause: format!("{:#}", exhausted.last_error),
        })
    }

    fn checkpoint(&self, state: &mut ExecutionState) -> Result<(), FlowError> {
        state.touch();
        self.collab.store.save(state).map_err(|err| {
            FlowError::store(format!("save checkpoint for '{}'", state.workflow_id), &err)
        })
    }

    /// Persist `Error` and hand back the failure.
    fn fail(&self, state: &mut ExecutionState, err: FlowError) -> FlowError {
        error!(workflow_id = %state.workflow_id, err = %err, "workflow failed");
        state.status = FlowStatus::Error;
        state.record(ActivityRecord::new(
            state.current_step,
            ActivityKind::Failed,
            err.to_string(),
        ));
        if let Err(save_err) = self.checkpoint(state) {
            error!(err = %save_err, "failed to persist error status");
        }
        err
    }

    /// Persist `Paused` after a cancellation request.
    fn pause(&self, state: &mut ExecutionState, next_step: u32) -> FlowError {
        warn!(workflow_id = %state.workflow_id, next_step, "workflow cancelled");
        state.status = FlowStatus::Paused;
        state.record(ActivityRecord::new(
            next_step,
            ActivityKind::Cancelled,
            format!("cancelled before step {next_step}"),
        ));
        if let Err(save_err) = self.checkpoint(state) {
            error!(err = %save_err, "failed to persist paused status");
        }
        FlowError::Cancelled {
            workflow_id: state.workflow_id.clone(),
            step: next_step,
        }
    }
}

/// Parse `key=value` pairs into string inputs.
pub fn parse_inputs(pairs: &[String]) -> Result<BTreeMap<String, String>, FlowError> {
    let mut inputs = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            FlowError::parse(None, format!("variable '{pair}' must be written as key=value"))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(FlowError::parse(None, format!("variable '{pair}' has an empty name")));
        }
        inputs.insert(key.to_string(), value.to_string());
    }
    Ok(inputs)
}

/// Read a string variable from a finished state.
pub fn variable_text(state: &ExecutionState, name: &str) -> Option<String> {
    state.variables.resolve(name).map(stringify)
}
