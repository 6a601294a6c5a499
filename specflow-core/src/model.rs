//! Core data model: the value types persisted in and derived from
//! `.specflow/orchestration-state.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub const SCHEMA_VERSION: &str = "3.0";

pub const DEFAULT_MAX_HEAL_ATTEMPTS: u32 = 1;
pub const DEFAULT_BATCH_SIZE_FALLBACK: usize = 15;
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_SESSION_DISCOVERY_POLL_MS: u64 = 500;
pub const DEFAULT_SESSION_DISCOVERY_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_TRANSCRIPT_POLL_MS: u64 = 1000;
pub const DEFAULT_CANCEL_GRACE_SECS: u64 = 5;
pub const DEFAULT_MAX_QUESTIONS_PER_INVOCATION: usize = 50;
pub const DEFAULT_TASKS_DOCUMENT_PATH: &str = "tasks.md";

pub type ProjectId = Uuid;
pub type ExecutionId = Uuid;
pub type WorkflowId = Uuid;
pub type QuestionId = String;

/// The steps of the workflow in their fixed, canonical order. `Step::index`
/// is the auto-repair lookup table from spec section 4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Design,
    Analyze,
    Implement,
    Verify,
    Merge,
    Complete,
}

impl Phase {
    /// Fixed index table used by `PersistentState`'s auto-repair to
    /// normalize a `step.index` that arrived as a string.
    pub fn index(self) -> Option<u32> {
        match self {
            Phase::Design => Some(0),
            Phase::Analyze => Some(1),
            Phase::Implement => Some(2),
            Phase::Verify => Some(3),
            Phase::Merge | Phase::Complete => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Phase> {
        match name {
            "design" => Some(Phase::Design),
            "analyze" => Some(Phase::Analyze),
            "implement" => Some(Phase::Implement),
            "verify" => Some(Phase::Verify),
            "merge" => Some(Phase::Merge),
            "complete" => Some(Phase::Complete),
            _ => None,
        }
    }

    /// Is `self` strictly before `other` in the canonical phase order?
    /// Used to validate `GoBack` targets.
    pub fn is_before(self, other: Phase) -> bool {
        fn order(p: Phase) -> u8 {
            match p {
                Phase::Design => 0,
                Phase::Analyze => 1,
                Phase::Implement => 2,
                Phase::Verify => 3,
                Phase::Merge => 4,
                Phase::Complete => 5,
            }
        }
        order(self) < order(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    InProgress,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    WaitingMerge,
    NeedsAttention,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Skip,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub issue: String,
    pub options: Vec<RecoveryAction>,
}

/// Budget, expressed in USD across the caps the runner tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub max_per_batch: f64,
    pub max_total: f64,
    pub healing_budget: f64,
    pub decision_budget: f64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_per_batch: 2.0,
            max_total: 20.0,
            healing_budget: 5.0,
            decision_budget: 1.0,
        }
    }
}

/// Immutable, user-supplied knobs for one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub auto_merge: bool,
    pub skip_design: bool,
    pub skip_analyze: bool,
    pub auto_heal_enabled: bool,
    pub max_heal_attempts: u32,
    pub batch_size_fallback: usize,
    pub pause_between_batches: bool,
    pub budget: Budget,
    /// Path, relative to the project directory, of the task document
    /// `BatchPlanner` parses on entry into the implement phase.
    pub tasks_document_path: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_merge: false,
            skip_design: false,
            skip_analyze: false,
            auto_heal_enabled: true,
            max_heal_attempts: DEFAULT_MAX_HEAL_ATTEMPTS,
            batch_size_fallback: DEFAULT_BATCH_SIZE_FALLBACK,
            pause_between_batches: false,
            budget: Budget::default(),
            tasks_document_path: DEFAULT_TASKS_DOCUMENT_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Healed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub section: String,
    pub task_ids: Vec<String>,
    pub status: BatchStatus,
    pub heal_attempts: u32,
    pub workflow_execution_id: Option<WorkflowId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchItem {
    pub fn new(section: impl Into<String>, task_ids: Vec<String>) -> Self {
        Self {
            section: section.into(),
            task_ids,
            status: BatchStatus::Pending,
            heal_attempts: 0,
            workflow_execution_id: None,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchState {
    pub current: usize,
    pub total: usize,
    pub items: Vec<BatchItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub decision: String,
    pub reason: String,
}

impl DecisionLogEntry {
    pub fn new(decision: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            decision: decision.into(),
            reason: reason.into(),
        }
    }
}

/// The root record for one end-to-end run of the workflow on one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationExecution {
    pub id: ExecutionId,
    pub project_id: ProjectId,
    pub status: ExecutionStatus,
    pub config: OrchestratorConfig,
    pub current_phase: Phase,
    pub batches: BatchState,
    pub executions: HashMap<String, WorkflowId>,
    pub decision_log: Vec<DecisionLogEntry>,
    pub recovery_context: Option<RecoveryContext>,
    pub total_cost_usd: f64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl OrchestrationExecution {
    pub fn new(project_id: ProjectId, config: OrchestratorConfig) -> Self {
        let now = Utc::now();
        let starting_phase = if config.skip_design {
            if config.skip_analyze {
                Phase::Implement
            } else {
                Phase::Analyze
            }
        } else {
            Phase::Design
        };
        Self {
            id: Uuid::new_v4(),
            project_id,
            status: ExecutionStatus::Running,
            config,
            current_phase: starting_phase,
            batches: BatchState::default(),
            executions: HashMap::new(),
            decision_log: Vec::new(),
            recovery_context: None,
            total_cost_usd: 0.0,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn log_decision(&mut self, decision: impl Into<String>, reason: impl Into<String>) {
        self.decision_log.push(DecisionLogEntry::new(decision, reason));
        self.updated_at = Utc::now();
    }

    /// Invariant I2: `batches.current` is only meaningful while in the
    /// implement phase of a non-terminal execution.
    pub fn current_batch(&self) -> Option<&BatchItem> {
        if self.current_phase != Phase::Implement || self.status.is_terminal() {
            return None;
        }
        self.batches.items.get(self.batches.current)
    }

    pub fn current_batch_mut(&mut self) -> Option<&mut BatchItem> {
        if self.current_phase != Phase::Implement || self.status.is_terminal() {
            return None;
        }
        self.batches.items.get_mut(self.batches.current)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    WaitingForInput,
    Completed,
    Failed,
    Cancelled,
    Detached,
    Stale,
}

/// The agent's structured final payload, a closed tagged union per spec
/// section 9 ("dynamic/duck-typed payloads ... never carry untyped data
/// inward").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentOutput {
    Completed {
        #[serde(default)]
        phase: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        artifacts: Vec<String>,
    },
    NeedsInput {
        #[serde(default)]
        message: Option<String>,
        questions: Vec<Question>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: WorkflowId,
    pub project_id: ProjectId,
    pub skill: String,
    pub status: WorkflowStatus,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_output: Option<AgentOutput>,
    pub transcript_path: Option<String>,
    pub cost: Option<f64>,
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn new(project_id: ProjectId, skill: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            skill: skill.into(),
            status: WorkflowStatus::Running,
            session_id: None,
            started_at: now,
            updated_at: now,
            last_output: None,
            transcript_path: None,
            cost: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub content: String,
    #[serde(default)]
    pub options: Option<Vec<QuestionOption>>,
    #[serde(default)]
    pub answer: Option<String>,
}

impl Question {
    pub fn is_pending(&self) -> bool {
        self.answer.is_none()
    }
}

/// Derived, not persisted: the output of `BatchPlanner::plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPlan {
    pub batches: Vec<PlannedBatch>,
    pub used_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedBatch {
    pub section: String,
    pub task_ids: Vec<String>,
}

/// Derived by parsing one JSONL transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Assistant,
    Tool,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: TranscriptRole,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub todos: Vec<String>,
    #[serde(default)]
    pub is_session_end: bool,
}

/// Top-level shape of `.specflow/orchestration-state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: ProjectId,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardState {
    pub active: bool,
    pub last_workflow: Option<WorkflowId>,
    pub execution: Option<ExecutionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub current: String,
    #[serde(deserialize_with = "deserialize_index_lenient")]
    pub index: u32,
    pub status: StepStatus,
}

/// Older persisted documents wrote `step.index` as a string. Accepting
/// either shape here keeps that drift inside valid JSON so
/// `PersistentStateStore::auto_repair` can normalize it, instead of
/// failing the whole load as `StateCorrupt`.
fn deserialize_index_lenient<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IndexValue {
        Number(u32),
        Text(String),
    }

    match IndexValue::deserialize(deserializer)? {
        IndexValue::Number(n) => Ok(n),
        IndexValue::Text(s) => Ok(s.parse().unwrap_or(0)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub number: u32,
    pub name: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationBlock {
    pub phase: PhaseState,
    pub step: StepState,
    pub dashboard: DashboardState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<OrchestrationExecution>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ActionHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
}

/// The single source of truth for one project's orchestration progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub schema_version: String,
    pub project: ProjectRef,
    pub orchestration: OrchestrationBlock,
    #[serde(default)]
    pub actions: ActionsBlock,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ActionsBlock {
    #[serde(default)]
    pub history: Vec<ActionHistoryEntry>,
}

impl PersistentState {
    pub fn new(project: ProjectRef) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            project,
            orchestration: OrchestrationBlock {
                phase: PhaseState {
                    number: 0,
                    name: "design".to_string(),
                    status: StepStatus::NotStarted,
                },
                step: StepState {
                    current: "design".to_string(),
                    index: 0,
                    status: StepStatus::NotStarted,
                },
                dashboard: DashboardState {
                    active: false,
                    last_workflow: None,
                    execution: None,
                },
                execution: None,
            },
            actions: ActionsBlock::default(),
            last_updated: now,
        }
    }
}
