//! Executor configuration stored under `.devflow/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Executor configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct FlowConfig {
    /// Skip optional steps and optional elicitations.
    pub fast_mode: bool,
    pub retry: RetryConfig,
    pub agent: AgentConfig,
    pub gates: GateConfig,
    pub escalation: EscalationConfig,
    pub limits: LimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Delay before attempt k (k >= 2) is `base_delay_secs * 2^(k-1)`.
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Each delay is scaled by a random factor in `[1 - r, 1 + r]`.
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 1,
            max_delay_secs: 60,
            jitter_ratio: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent argv; the rendered prompt is written to stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    pub default_threshold: f64,
    /// Per-gate threshold overrides keyed by gate name.
    pub thresholds: BTreeMap<String, f64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            default_threshold: 85.0,
            thresholds: BTreeMap::new(),
        }
    }
}

impl GateConfig {
    /// Threshold for `gate`: explicit step value, then override, then default.
    pub fn threshold_for(&self, gate: &str, explicit: Option<f64>) -> f64 {
        explicit
            .or_else(|| self.thresholds.get(gate).copied())
            .unwrap_or(self.default_threshold)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EscalationConfig {
    /// Elicitation answers below this confidence raise an escalation.
    pub min_confidence: f64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitConfig {
    /// Maximum step executions per run.
    pub max_transitions: u32,
    /// Maximum sub-workflow nesting.
    pub max_depth: u32,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_transitions: 1000,
            max_depth: 8,
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            return Err(anyhow!("retry.max_delay_secs must be >= retry.base_delay_secs"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(anyhow!("retry.jitter_ratio must be within [0, 1]"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        let thresholds = std::iter::once(("default_threshold", self.gates.default_threshold))
            .chain(self.gates.thresholds.iter().map(|(k, v)| (k.as_str(), *v)));
        for (name, value) in thresholds {
            if !(0.0..=100.0).contains(&value) {
                return Err(anyhow!("gates threshold '{name}' must be within [0, 100]"));
            }
        }
        if !(0.0..=1.0).contains(&self.escalation.min_confidence) {
            return Err(anyhow!("escalation.min_confidence must be within [0, 1]"));
        }
        if self.limits.max_transitions == 0 {
            return Err(anyhow!("limits.max_transitions must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FlowConfig::default()`.
pub fn load_config(path: &Path) -> Result<FlowConfig> {
    if !path.exists() {
        let cfg = FlowConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FlowConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FlowConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
