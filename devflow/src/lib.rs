//! Resumable workflow executor for agent-driven development pipelines.
//!
//! A workflow is a markup document of numbered steps. Each step holds actions
//! (agent prompts, questions, rendered files, jumps, nested workflows) and
//! conditional checks. The [`sequencer`] interprets steps one at a time,
//! checkpointing after each so an interrupted run resumes where it stopped.
//!
//! - **[`core`]**: Pure, deterministic logic (markup parsing, variables,
//!   conditions, checkpoint state). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (agent process, state store,
//!   escalations, workspace files, config). Behind traits for test doubles.
//!
//! Orchestration modules ([`sequencer`], [`gate`], [`retry`], [`pipeline`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod retry;
pub mod sequencer;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::FlowError;
