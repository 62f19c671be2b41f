//! CLI tests for the `devflow` binary.
//!
//! Spawns the binary against a scratch project and verifies exit codes for
//! valid, invalid, completed, and gate-blocked runs.

use std::path::Path;
use std::process::{Command, Output};

use devflow::exit_codes;
use devflow::io::config::{FlowConfig, write_config};
use devflow::io::init::{FlowPaths, InitOptions, init_workspace};
use devflow::io::state_store::FileStateStore;

fn devflow(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_devflow"))
        .current_dir(root)
        .args(args)
        .output()
        .expect("spawn devflow")
}

/// Initialize `root` with an agent that ignores its prompt and prints `reply`.
fn init_with_agent(root: &Path, reply: &str) {
    let paths = init_workspace(root, &InitOptions { force: false }).expect("init");
    let mut config = FlowConfig::default();
    config.agent.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("cat >/dev/null; printf '%s' '{reply}'"),
    ];
    config.agent.timeout_secs = 10;
    config.retry.max_attempts = 1;
    write_config(&paths.config_path, &config).expect("write config");
}

#[test]
fn validate_sample_workflow_succeeds() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = devflow(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));

    let out = devflow(temp.path(), &["validate", ".devflow/workflows/example.md"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("workflow=example steps=3"));
}

#[test]
fn validate_rejects_bad_markup() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        temp.path().join("bad.md"),
        "<step n=\"1\" goal=\"a\"><goto step=\"soon\"/></step>\n",
    )
    .expect("write");
    let out = devflow(temp.path(), &["validate", "bad.md"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("parse error"));
}

#[test]
fn run_completes_and_status_reports_it() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_with_agent(temp.path(), "three bullet points");

    let out = devflow(
        temp.path(),
        &[
            "run",
            ".devflow/workflows/example.md",
            "--id",
            "notes-1",
            "--var",
            "topic=caching",
            "--fast",
        ],
    );
    assert_eq!(
        out.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let store = FileStateStore::new(FlowPaths::new(temp.path()).state_dir).expect("store");
    assert!(store.path_for("notes-1").exists());

    let status = devflow(temp.path(), &["status", "notes-1"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&status.stdout);
    assert!(stdout.contains("status=completed step=3"));

    let again = devflow(
        temp.path(),
        &["resume", ".devflow/workflows/example.md", "--id", "notes-1"],
    );
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&again.stderr).contains("already completed"));
}

#[test]
fn blocked_gate_exits_with_gate_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_with_agent(temp.path(), r#"{"content": "unsure", "confidence": 0.4}"#);
    std::fs::write(
        temp.path().join("gated.md"),
        "<step n=\"1\" goal=\"Draft\"><action>draft</action></step>\n\
         <step n=\"2\" goal=\"Review\" gate=\"review\"><output>done</output></step>\n",
    )
    .expect("write");

    let out = devflow(temp.path(), &["run", "gated.md"]);
    assert_eq!(out.status.code(), Some(exit_codes::GATE_BLOCKED));
    assert!(String::from_utf8_lossy(&out.stderr).contains("gate 'review' blocked step 2"));

    let status = devflow(temp.path(), &["status", "gated"]);
    let stdout = String::from_utf8_lossy(&status.stdout);
    assert!(stdout.contains("status=error step=1"));
    assert!(stdout.contains("escalation id=esc-"));
}

#[test]
fn status_for_unknown_id_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = devflow(temp.path(), &["status", "missing"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("no checkpoint found"));
}
