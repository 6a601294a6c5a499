//! Error taxonomy for the orchestration core.
//!
//! Variants map 1:1 onto the error kinds the decision loop must classify
//! every failure into before logging it to a project's decision log.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A subprocess invocation failed once (non-zero exit, timeout, or an
    /// unreadable transcript). Recoverable via `AutoHealer` for implement
    /// batches; otherwise surfaced as `needs_attention`.
    #[error("agent invocation failed: {reason}")]
    TransientAgent { reason: String },

    /// A request was rejected synchronously; state is left unchanged.
    #[error("invalid request: {reason}")]
    ConfigInvalid { reason: String },

    /// Persisted state failed to parse as JSON at all.
    #[error("persisted state is corrupt: {source}")]
    StateCorrupt {
        #[source]
        source: serde_json::Error,
    },

    /// Persisted state parsed but failed semantic validation on a specific
    /// field. Auto-repaired on load; this variant exists to name the field
    /// in the decision-log entry the repair produces.
    #[error("persisted state failed validation on field `{field}`")]
    StateSemantic { field: String },

    /// The agent's structured output failed schema validation or exceeded a
    /// protocol limit (e.g. too many questions). Treated identically to
    /// `TransientAgent` by callers.
    #[error("agent protocol violation: {reason}")]
    AgentProtocol { reason: String },

    /// Cumulative cost passed a configured budget cap.
    #[error("budget exceeded for {dimension}: {actual:.2} > {limit:.2}")]
    BudgetExceeded {
        dimension: String,
        limit: f64,
        actual: f64,
    },

    /// A question id referenced by `Answer` does not exist in the queue.
    #[error("unknown question: {question_id}")]
    UnknownQuestion { question_id: String },

    /// `Answer` was called twice for the same question.
    #[error("question already answered: {question_id}")]
    AlreadyAnswered { question_id: String },

    /// No project is registered under the given id.
    #[error("unknown project: {project_id}")]
    UnknownProject { project_id: String },

    /// An operation that requires a non-terminal, running execution was
    /// invoked while none exists or the existing one is terminal.
    #[error("no active orchestration for project: {project_id}")]
    NoActiveExecution { project_id: String },

    /// An operation was rejected because a non-terminal execution already
    /// exists for the project (invariant I1).
    #[error("orchestration already running for project: {project_id}")]
    AlreadyRunning { project_id: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),
}

impl From<String> for Error {
    fn from(reason: String) -> Self {
        Error::ConfigInvalid { reason }
    }
}

/// Renders the error as its display string. Mirrors the teacher's rationale
/// for doing the same with its own error type: callers that speak JSON
/// (the CLI, or any future HTTP layer) want a plain string, not our variant
/// structure.
impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
