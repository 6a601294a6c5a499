//! Core orchestration engine: drives an AI coding agent through the
//! design/analyze/implement/verify/merge lifecycle for one or more
//! projects, persisting all progress so a crashed or restarted process
//! picks back up exactly where it left off.

pub mod auto_healer;
pub mod batch_planner;
pub mod error;
pub mod model;
pub mod persistent_state;
pub mod questions;
pub mod runner;
pub mod transcript;
pub mod workflow_executor;

pub use error::{Error, Result};
pub use model::{
    AgentOutput, BatchPlan, ExecutionStatus, OrchestrationExecution, OrchestratorConfig, Phase,
    PersistentState, ProjectId, ProjectRef, Question, RecoveryAction, WorkflowExecution,
    WorkflowId, WorkflowStatus,
};
pub use runner::{decide, Decision, Orchestrator};
pub use workflow_executor::{ProcessWorkflowExecutor, ScriptedLauncher, WorkflowLauncher};
