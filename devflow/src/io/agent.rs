//! Agent abstraction for step actions.
//!
//! The [`Agent`] trait decouples the sequencer from the actual agent backend
//! (by default `codex exec -`). Tests use scripted agents that return
//! predetermined responses without spawning processes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::AgentResponse;
use crate::io::config::AgentConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::PromptEngine;

/// Parameters for one agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    /// Fully substituted instruction text.
    pub task: String,
    /// Where the call happens (workflow id, step, goal).
    pub context: BTreeMap<String, String>,
}

/// Abstraction over agent backends.
pub trait Agent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse>;
}

/// Agent that spawns a configured command and feeds the prompt on stdin.
pub struct CommandAgent {
    config: AgentConfig,
    workdir: PathBuf,
    prompts: PromptEngine,
}

impl CommandAgent {
    pub fn new(config: AgentConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            workdir: workdir.into(),
            prompts: PromptEngine::new(),
        }
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(program = ?self.config.command.first(), timeout_secs = self.config.timeout_secs))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let prompt = self
            .prompts
            .render_task(&request.task, &request.context)
            .context("render agent prompt")?;

        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent.command must not be empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);

        info!(workdir = %self.workdir.display(), "invoking agent");
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            timeout,
            self.config.output_limit_bytes,
        )
        .with_context(|| format!("run agent command {program}"))?;

        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "agent timed out");
            return Err(anyhow!("agent timed out after {:?}", timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(anyhow!(
                "agent exited with status {:?}: {}",
                output.status.code(),
                output.stderr_tail(400)
            ));
        }

        let response = parse_response(&output.stdout_text());
        debug!(confidence = response.confidence, bytes = response.content.len(), "agent responded");
        Ok(response)
    }
}

#[derive(Deserialize)]
struct Reply {
    content: String,
    #[serde(default = "full_confidence")]
    confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

/// Interpret agent stdout: a `{content, confidence}` JSON object when the
/// agent followed the response format, otherwise the raw text at full confidence.
pub fn parse_response(stdout: &str) -> AgentResponse {
    let trimmed = stdout.trim();
    match serde_json::from_str::<Reply>(trimmed) {
        Ok(reply) => AgentResponse {
            content: reply.content,
            confidence: reply.confidence.clamp(0.0, 1.0),
        },
        Err(_) => AgentResponse {
            content: trimmed.to_string(),
            confidence: 1.0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_agent(script: &str, workdir: &std::path::Path) -> CommandAgent {
        let config = AgentConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs: 10,
            output_limit_bytes: 10_000,
        };
        CommandAgent::new(config, workdir)
    }

    fn request() -> AgentRequest {
        AgentRequest {
            task: "Summarize".to_string(),
            context: BTreeMap::from([("step".to_string(), "1".to_string())]),
        }
    }

    #[test]
    fn parses_json_reply() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = sh_agent(
            r#"cat >/dev/null; echo '{"content":"done","confidence":0.4}'"#,
            temp.path(),
        );
        let response = agent.invoke(&request()).expect("invoke");
        assert_eq!(response.content, "done");
        assert_eq!(response.confidence, 0.4);
    }

    #[test]
    fn plain_text_reply_has_full_confidence() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = sh_agent("cat >/dev/null; echo plain answer", temp.path());
        let response = agent.invoke(&request()).expect("invoke");
        assert_eq!(response.content, "plain answer");
        assert_eq!(response.confidence, 1.0);
    }

    #[test]
    fn prompt_reaches_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = sh_agent("grep -c '<task>'", temp.path());
        let response = agent.invoke(&request()).expect("invoke");
        assert_eq!(response.content, "1");
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = sh_agent("cat >/dev/null; echo boom >&2; exit 2", temp.path());
        let err = agent.invoke(&request()).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("Some(2)"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn confidence_is_clamped_and_defaulted() {
        assert_eq!(parse_response(r#"{"content":"x","confidence":7}"#).confidence, 1.0);
        assert_eq!(parse_response(r#"{"content":"x"}"#).confidence, 1.0);
        assert_eq!(parse_response(r#"{"other":1}"#).content, r#"{"other":1}"#);
    }
}
