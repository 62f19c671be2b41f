//! Stable exit codes for devflow CLI commands.

/// Command succeeded or the workflow completed.
pub const OK: i32 = 0;
/// Invalid definition, config, or checkpoint, or the workflow failed.
pub const INVALID: i32 = 1;
/// A gated checkpoint blocked the workflow; see the raised escalation.
pub const GATE_BLOCKED: i32 = 3;
/// The workflow was cancelled and its checkpoint left `paused`.
pub const PAUSED: i32 = 4;
