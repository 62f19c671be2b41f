//! Test-only scripted collaborators for driving the sequencer without I/O.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::state::ExecutionState;
use crate::core::types::AgentResponse;
use crate::error::FlowError;
use crate::gate::{GateInput, Validation, Validator};
use crate::io::agent::{Agent, AgentRequest};
use crate::io::escalation::{Escalation, EscalationSink};
use crate::io::state_store::StateStore;
use crate::retry::Sleeper;

/// One scripted agent reply.
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(AgentResponse),
    Fail(String),
}

/// Agent that pops queued replies and records every request.
///
/// When the queue is empty it answers `"ok"` at full confidence.
#[derive(Default)]
pub struct ScriptedAgent {
    queue: RefCell<VecDeque<Scripted>>,
    requests: RefCell<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, content: &str) -> Self {
        self.reply_with(content, 1.0)
    }

    pub fn reply_with(self, content: &str, confidence: f64) -> Self {
        self.queue.borrow_mut().push_back(Scripted::Reply(AgentResponse {
            content: content.to_string(),
            confidence,
        }));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.queue
            .borrow_mut()
            .push_back(Scripted::Fail(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }

    /// Task text of every request, in call order.
    pub fn tasks(&self) -> Vec<String> {
        self.requests.borrow().iter().map(|r| r.task.clone()).collect()
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse> {
        self.requests.borrow_mut().push(request.clone());
        match self.queue.borrow_mut().pop_front() {
            Some(Scripted::Reply(response)) => Ok(response),
            Some(Scripted::Fail(message)) => Err(anyhow!(message)),
            None => Ok(AgentResponse {
                content: "ok".to_string(),
                confidence: 1.0,
            }),
        }
    }
}

/// In-memory state store that keeps every saved snapshot.
#[derive(Default)]
pub struct MemoryStateStore {
    latest: RefCell<BTreeMap<String, ExecutionState>>,
    saves: RefCell<Vec<ExecutionState>>,
    corrupt: RefCell<BTreeMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a checkpoint without recording a save.
    pub fn insert(&self, state: ExecutionState) {
        self.latest
            .borrow_mut()
            .insert(state.workflow_id.clone(), state);
    }

    /// Make `load(workflow_id)` fail as an unreadable checkpoint.
    pub fn mark_corrupt(&self, workflow_id: &str, reason: &str) {
        self.corrupt
            .borrow_mut()
            .insert(workflow_id.to_string(), reason.to_string());
    }

    pub fn latest(&self, workflow_id: &str) -> Option<ExecutionState> {
        self.latest.borrow().get(workflow_id).cloned()
    }

    /// `(current_step, status)` of each save for one workflow id.
    pub fn progress(&self, workflow_id: &str) -> Vec<(u32, &'static str)> {
        self.saves
            .borrow()
            .iter()
            .filter(|s| s.workflow_id == workflow_id)
            .map(|s| (s.current_step, s.status.as_str()))
            .collect()
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, state: &ExecutionState) -> Result<()> {
        self.saves.borrow_mut().push(state.clone());
        self.insert(state.clone());
        Ok(())
    }

    fn load(&self, workflow_id: &str) -> Result<Option<ExecutionState>, FlowError> {
        if let Some(reason) = self.corrupt.borrow().get(workflow_id) {
            return Err(FlowError::StateCorruption {
                workflow_id: workflow_id.to_string(),
                reason: reason.clone(),
            });
        }
        Ok(self.latest(workflow_id))
    }
}

/// Escalation sink that records escalations and hands out `esc-<n>` ids.
#[derive(Default)]
pub struct RecordingEscalationSink {
    raised: RefCell<Vec<Escalation>>,
}

impl RecordingEscalationSink {
    pub fn raised(&self) -> Vec<Escalation> {
        self.raised.borrow().clone()
    }
}

impl EscalationSink for RecordingEscalationSink {
    fn raise(&self, escalation: &Escalation) -> Result<String> {
        let mut raised = self.raised.borrow_mut();
        raised.push(escalation.clone());
        Ok(format!("esc-{}", raised.len()))
    }
}

/// Validator returning a fixed (but adjustable) verdict.
pub struct FixedValidator {
    score: Cell<f64>,
    required: Vec<String>,
    satisfied: Vec<String>,
    calls: Cell<u32>,
}

impl FixedValidator {
    pub fn new(score: f64) -> Self {
        Self {
            score: Cell::new(score),
            required: Vec::new(),
            satisfied: Vec::new(),
            calls: Cell::new(0),
        }
    }

    pub fn requiring(mut self, items: &[&str]) -> Self {
        self.required = items.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn satisfying(mut self, items: &[&str]) -> Self {
        self.satisfied = items.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn set_score(&self, score: f64) {
        self.score.set(score);
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }
}

impl Validator for FixedValidator {
    fn validate(&self, _input: &GateInput<'_>) -> Result<Validation> {
        self.calls.set(self.calls.get() + 1);
        Ok(Validation {
            score: self.score.get(),
            required: self.required.clone(),
            satisfied: self.satisfied.clone(),
        })
    }
}

/// Sleeper that records requested delays instead of sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}
