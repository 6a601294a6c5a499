//! Command-line front end for the orchestration core.
//!
//! Subcommands map 1:1 onto the Core API table; this binary only parses
//! arguments, loads project identity from the persisted state file, and
//! renders results as JSON. All orchestration logic lives in
//! `specflow_core`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use specflow_core::workflow_executor::{AgentCliConfig, ProcessWorkflowExecutor};
use specflow_core::{Error, Orchestrator, OrchestratorConfig, Phase, ProjectRef, RecoveryAction};

#[derive(Parser)]
#[command(name = "specflow", about = "Drive an AI coding agent through a staged build workflow")]
struct Cli {
    /// Project directory; defaults to the current directory.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Begin a new orchestration run for this project.
    Start {
        #[arg(long, default_value = "project")]
        name: String,
        #[arg(long)]
        auto_merge: bool,
        #[arg(long)]
        skip_design: bool,
        #[arg(long)]
        skip_analyze: bool,
        #[arg(long)]
        batch_size_fallback: Option<usize>,
        #[arg(long)]
        max_heal_attempts: Option<u32>,
        /// Path, relative to `--project-dir`, of the task document the
        /// implement phase plans batches from.
        #[arg(long, default_value = specflow_core::model::DEFAULT_TASKS_DOCUMENT_PATH)]
        tasks_file: String,
    },
    /// Print the current execution state as JSON.
    Status,
    /// Parse the project's task document into a batch plan without
    /// starting anything.
    PreviewBatches {
        #[arg(long, default_value = "tasks.md")]
        tasks_file: PathBuf,
        #[arg(long, default_value_t = specflow_core::model::DEFAULT_BATCH_SIZE_FALLBACK)]
        batch_size_fallback: usize,
    },
    /// Suspend the running orchestration.
    Pause,
    /// Resume a paused orchestration.
    Resume,
    /// Hard-stop the orchestration and any in-flight workflow.
    Cancel,
    /// Advance out of `waiting_merge`.
    TriggerMerge,
    /// Resolve a `needs_attention` state.
    Recover {
        #[arg(value_enum)]
        action: RecoverActionArg,
    },
    /// Rewind to an earlier phase.
    GoBack {
        #[arg(value_enum)]
        phase: PhaseArg,
    },
    /// Answer a pending question from an in-flight workflow.
    Answer {
        #[arg(long)]
        workflow_id: uuid::Uuid,
        #[arg(long)]
        question_id: String,
        #[arg(long)]
        value: String,
    },
    /// Print transcript messages for the current workflow's session.
    Transcript {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        tail: Option<usize>,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum RecoverActionArg {
    Retry,
    Skip,
    Abort,
}

impl From<RecoverActionArg> for RecoveryAction {
    fn from(value: RecoverActionArg) -> Self {
        match value {
            RecoverActionArg::Retry => RecoveryAction::Retry,
            RecoverActionArg::Skip => RecoveryAction::Skip,
            RecoverActionArg::Abort => RecoveryAction::Abort,
        }
    }
}

#[derive(Clone, clap::ValueEnum)]
enum PhaseArg {
    Design,
    Analyze,
    Implement,
    Verify,
}

impl From<PhaseArg> for Phase {
    fn from(value: PhaseArg) -> Self {
        match value {
            PhaseArg::Design => Phase::Design,
            PhaseArg::Analyze => Phase::Analyze,
            PhaseArg::Implement => Phase::Implement,
            PhaseArg::Verify => Phase::Verify,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let project_dir = cli
        .project_dir
        .unwrap_or_else(|| PathBuf::from("."));

    match run(&project_dir, cli.command).await {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            ExitCode::from(0)
        }
        Err(err) => {
            eprintln!("{err}");
            match err {
                Error::ConfigInvalid { .. } => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run(project_dir: &Path, command: Command) -> specflow_core::Result<serde_json::Value> {
    let launcher = Arc::new(ProcessWorkflowExecutor::new(AgentCliConfig::default()));
    let orchestrator = Orchestrator::new(launcher);

    match command {
        Command::Start {
            name,
            auto_merge,
            skip_design,
            skip_analyze,
            batch_size_fallback,
            max_heal_attempts,
            tasks_file,
        } => {
            let project = ProjectRef {
                id: uuid::Uuid::new_v4(),
                name,
                path: project_dir.to_string_lossy().to_string(),
            };
            let mut config = OrchestratorConfig::default();
            config.auto_merge = auto_merge;
            config.skip_design = skip_design;
            config.skip_analyze = skip_analyze;
            config.tasks_document_path = tasks_file;
            if let Some(size) = batch_size_fallback {
                config.batch_size_fallback = size;
            }
            if let Some(attempts) = max_heal_attempts {
                config.max_heal_attempts = attempts;
            }
            let execution = orchestrator.start(project_dir.to_path_buf(), project, config).await?;
            Ok(serde_json::to_value(execution).unwrap_or_default())
        }
        Command::Status => {
            let execution = orchestrator.status(project_dir).await?;
            Ok(serde_json::to_value(execution).unwrap_or_default())
        }
        Command::PreviewBatches {
            tasks_file,
            batch_size_fallback,
        } => {
            let plan = orchestrator
                .preview_batches(&tasks_file, batch_size_fallback)
                .await?;
            Ok(serde_json::to_value(plan).unwrap_or_default())
        }
        Command::Pause => {
            let project_id = current_project_id(&orchestrator, project_dir).await?;
            orchestrator.pause(project_dir, project_id).await?;
            Ok(serde_json::json!({"ok": true}))
        }
        Command::Resume => {
            let project_id = current_project_id(&orchestrator, project_dir).await?;
            orchestrator.resume(project_dir, project_id).await?;
            Ok(serde_json::json!({"ok": true}))
        }
        Command::Cancel => {
            let project_id = current_project_id(&orchestrator, project_dir).await?;
            orchestrator.cancel(project_dir, project_id).await?;
            Ok(serde_json::json!({"ok": true}))
        }
        Command::TriggerMerge => {
            let project_id = current_project_id(&orchestrator, project_dir).await?;
            orchestrator.trigger_merge(project_dir, project_id).await?;
            Ok(serde_json::json!({"ok": true}))
        }
        Command::Recover { action } => {
            let project_id = current_project_id(&orchestrator, project_dir).await?;
            orchestrator
                .recover(project_dir, project_id, action.into())
                .await?;
            Ok(serde_json::json!({"ok": true}))
        }
        Command::GoBack { phase } => {
            let project_id = current_project_id(&orchestrator, project_dir).await?;
            orchestrator
                .go_back(project_dir, project_id, phase.into())
                .await?;
            Ok(serde_json::json!({"ok": true}))
        }
        Command::Answer {
            workflow_id,
            question_id,
            value,
        } => {
            let project_id = current_project_id(&orchestrator, project_dir).await?;
            orchestrator
                .answer(project_dir, project_id, workflow_id, &question_id, value)
                .await?;
            Ok(serde_json::json!({"ok": true}))
        }
        Command::Transcript { path, tail } => {
            let messages = orchestrator.transcript(&path, tail).await?;
            Ok(serde_json::to_value(messages).unwrap_or_default())
        }
    }
}

async fn current_project_id(
    orchestrator: &Orchestrator,
    project_dir: &Path,
) -> specflow_core::Result<uuid::Uuid> {
    let execution = orchestrator.status(project_dir).await?;
    Ok(execution.project_id)
}
