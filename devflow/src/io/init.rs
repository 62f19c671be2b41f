//! Initialization helpers for `.devflow/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{FlowConfig, write_config};

/// All canonical paths within `.devflow/` for a project root.
#[derive(Debug, Clone)]
pub struct FlowPaths {
    pub root: PathBuf,
    pub devflow_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    /// Checkpoints, one `<workflow-id>.json` per instance.
    pub state_dir: PathBuf,
    pub escalations_dir: PathBuf,
    /// Gap reports for blocked gates, one directory per workflow id.
    pub gates_dir: PathBuf,
    pub workflows_dir: PathBuf,
    pub sample_workflow_path: PathBuf,
}

impl FlowPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let devflow_dir = root.join(".devflow");
        let workflows_dir = devflow_dir.join("workflows");
        Self {
            root: root.clone(),
            devflow_dir: devflow_dir.clone(),
            config_path: devflow_dir.join("config.toml"),
            gitignore_path: devflow_dir.join(".gitignore"),
            state_dir: devflow_dir.join("state"),
            escalations_dir: devflow_dir.join("escalations"),
            gates_dir: devflow_dir.join("gates"),
            workflows_dir: workflows_dir.clone(),
            sample_workflow_path: workflows_dir.join("example.md"),
        }
    }

    /// Gap report location, relative to the project root.
    pub fn gap_report_rel(workflow_id: &str, step: u32, gate: &str) -> String {
        format!(".devflow/gates/{workflow_id}/step-{step}-{gate}.md")
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing devflow-owned files.
    pub force: bool,
}

/// Create `.devflow/` scaffolding in `root`.
///
/// Fails if `.devflow/` already exists unless `options.force` is set.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<FlowPaths> {
    let paths = FlowPaths::new(root);
    if paths.devflow_dir.exists() && !paths.devflow_dir.is_dir() {
        return Err(anyhow!("devflow init: .devflow exists but is not a directory"));
    }
    if paths.devflow_dir.exists() && !options.force {
        return Err(anyhow!(
            "devflow init: .devflow already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.devflow_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&paths.escalations_dir)?;
    create_dir(&paths.gates_dir)?;
    create_dir(&paths.workflows_dir)?;

    write_file(&paths.gitignore_path, DEVFLOW_GITIGNORE)?;
    write_config(&paths.config_path, &FlowConfig::default())?;
    write_file(&paths.sample_workflow_path, SAMPLE_WORKFLOW)?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const DEVFLOW_GITIGNORE: &str = "state/\nescalations/\ngates/\n";

const SAMPLE_WORKFLOW: &str = r#"<workflow name="example">
<step n="1" goal="Summarize the request">
  <action>Summarize the request for {{topic|the project}} in three bullet points.</action>
</step>
<step n="2" goal="Ask for details" optional="true">
  <ask>Which constraints matter most?</ask>
</step>
<step n="3" goal="Write notes">
  <template-output file="docs/notes-{{date}}.md">
# Notes for {{topic|the project}}

{{last_response}}
  </template-output>
  <output>Notes written for {{workflow-id}}</output>
</step>
</workflow>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::markup::parse_definition;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.devflow_dir.is_dir());
        assert!(paths.state_dir.is_dir());
        assert!(paths.escalations_dir.is_dir());
        assert!(paths.gates_dir.is_dir());
        assert!(paths.config_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            DEVFLOW_GITIGNORE
        );

        let sample = fs::read_to_string(&paths.sample_workflow_path).expect("read");
        let def = parse_definition(&sample, "example").expect("sample parses");
        assert!(def.validate_all().is_empty());
    }

    #[test]
    fn init_without_force_refuses_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_workspace(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_sample() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.sample_workflow_path, "custom").expect("write custom");
        init_workspace(temp.path(), &InitOptions { force: true }).expect("re-init");
        assert_eq!(
            fs::read_to_string(&paths.sample_workflow_path).expect("read"),
            SAMPLE_WORKFLOW
        );
    }
}
