//! Resumable workflow executor CLI.
//!
//! Runs markup workflow definitions step by step against a configured agent,
//! checkpointing under `.devflow/state/` so interrupted runs can resume.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use devflow::FlowError;
use devflow::core::state::ExecutionState;
use devflow::core::types::FlowStatus;
use devflow::exit_codes;
use devflow::gate::Validators;
use devflow::io::agent::CommandAgent;
use devflow::io::config::load_config;
use devflow::io::definition::{file_stem, load_definition};
use devflow::io::escalation::FileEscalationSink;
use devflow::io::init::{FlowPaths, InitOptions, init_workspace};
use devflow::io::state_store::{FileStateStore, StateStore};
use devflow::io::workspace::DirWorkspace;
use devflow::logging;
use devflow::pipeline::{AgentValidator, story_definition, story_inputs, story_workflow_id};
use devflow::retry::{RetryPolicy, ThreadSleeper};
use devflow::sequencer::{Collaborators, Sequencer, parse_inputs};

#[derive(Parser)]
#[command(
    name = "devflow",
    version,
    about = "Resumable workflow executor for agent-driven development"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.devflow/` with default config and a sample workflow.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Parse a definition, including every step body.
    Validate { definition: PathBuf },
    /// Start a new workflow instance.
    Run {
        definition: PathBuf,
        /// Instance id (defaults to the definition's file stem).
        #[arg(long)]
        id: Option<String>,
        /// Input variable, `key=value`. Repeatable.
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Skip optional steps and optional questions.
        #[arg(long)]
        fast: bool,
    },
    /// Continue an instance from its checkpoint.
    Resume {
        definition: PathBuf,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        fast: bool,
    },
    /// Print an instance's checkpoint summary and escalations.
    Status { id: String },
    /// Run (or resume) the built-in nine-step story pipeline.
    Story {
        story_id: String,
        #[arg(long)]
        fast: bool,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Validate { definition } => cmd_validate(&definition),
        Command::Run {
            definition,
            id,
            vars,
            fast,
        } => {
            let loaded = load_definition(&definition)?;
            let id = id.unwrap_or_else(|| file_stem(&definition));
            let inputs = parse_inputs(&vars)?;
            execute(&root, fast, |seq| seq.start(&loaded, &id, &inputs))
        }
        Command::Resume {
            definition,
            id,
            fast,
        } => {
            let loaded = load_definition(&definition)?;
            let id = id.unwrap_or_else(|| file_stem(&definition));
            execute(&root, fast, |seq| seq.resume(&loaded, &id))
        }
        Command::Status { id } => cmd_status(&root, &id),
        Command::Story { story_id, fast } => cmd_story(&root, &story_id, fast),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("init: config={}", paths.config_path.display());
    println!("init: sample={}", paths.sample_workflow_path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let loaded = load_definition(path)?;
    let errors = loaded.definition.validate_all();
    if !errors.is_empty() {
        for err in &errors {
            eprintln!("{}: {}", path.display(), err);
        }
        return Ok(exit_codes::INVALID);
    }
    println!(
        "validate: workflow={} steps={} digest={}",
        loaded.definition.name,
        loaded.definition.steps.len(),
        loaded.digest
    );
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path, id: &str) -> Result<i32> {
    let paths = FlowPaths::new(root);
    let store = FileStateStore::new(&paths.state_dir)?;
    let state = store
        .load(id)?
        .ok_or_else(|| FlowError::CheckpointNotFound {
            workflow_id: id.to_string(),
        })?;
    print_state("status", &state);
    for record in state.history.iter().rev().take(5).rev() {
        println!(
            "status: history step={} kind={:?} detail={}",
            record.step, record.kind, record.detail
        );
    }
    let escalations = FileEscalationSink::new(&paths.escalations_dir).list_for(id)?;
    for record in escalations {
        println!(
            "status: escalation id={} step={} question={}",
            record.id, record.escalation.step, record.escalation.question
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_story(root: &Path, story_id: &str, fast: bool) -> Result<i32> {
    let loaded = story_definition()?;
    let id = story_workflow_id(story_id)?;
    let paths = FlowPaths::new(root);
    let existing = FileStateStore::new(&paths.state_dir)?.load(&id)?;
    match existing {
        Some(state) if state.status == FlowStatus::Completed => {
            Err(FlowError::AlreadyCompleted { workflow_id: id }.into())
        }
        Some(state) => {
            debug!(workflow_id = %id, status = state.status.as_str(), "resuming story");
            execute(root, fast, |seq| seq.resume(&loaded, &id))
        }
        None => {
            let inputs = story_inputs(story_id);
            execute(root, fast, |seq| seq.start(&loaded, &id, &inputs))
        }
    }
}

/// Wire file-backed collaborators for `root` and run `op` with them.
fn execute(
    root: &Path,
    fast: bool,
    op: impl FnOnce(&Sequencer<'_>) -> Result<ExecutionState, FlowError>,
) -> Result<i32> {
    let paths = FlowPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let store = FileStateStore::new(&paths.state_dir)?;
    let escalations = FileEscalationSink::new(&paths.escalations_dir);
    let workspace = DirWorkspace::new(root);
    let agent = CommandAgent::new(config.agent.clone(), root);
    let sleeper = ThreadSleeper;
    let reviewer = AgentValidator::new(&agent, RetryPolicy::from_config(&config.retry), &sleeper);
    let validators = Validators::new().with_fallback(&reviewer);

    let collab = Collaborators {
        agent: &agent,
        store: &store,
        escalations: &escalations,
        workspace: &workspace,
        validators: &validators,
        sleeper: &sleeper,
    };
    let seq = Sequencer::new(collab, &config).fast(fast || config.fast_mode);
    let state = op(&seq)?;
    print_state("run", &state);
    Ok(exit_codes::OK)
}

fn print_state(prefix: &str, state: &ExecutionState) {
    println!(
        "{prefix}: id={} workflow={} status={} step={}",
        state.workflow_id,
        state.workflow_name,
        state.status.as_str(),
        state.current_step
    );
    println!("{prefix}: last_update={}", state.last_update.to_rfc3339());
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<FlowError>() {
        Some(flow) if flow.is_blocking_gate() => exit_codes::GATE_BLOCKED,
        Some(flow) if matches!(flow.root_cause(), FlowError::Cancelled { .. }) => {
            exit_codes::PAUSED
        }
        _ => exit_codes::INVALID,
    }
}
