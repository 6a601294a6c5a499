//! Retries a failed implement batch with a targeted fixer subprocess.
//!
//! Grounded on `engine.rs::mark_task_error`'s retry/escalate split and
//! `types.rs::Budget::is_exceeded` for the cumulative-cost cap check.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{BatchItem, BatchStatus, OrchestratorConfig, ProjectId, RecoveryAction, RecoveryContext};
use crate::workflow_executor::{StartOptions, WorkflowLauncher};

/// Outcome of one `AutoHealer::attempt` call, consumed by the runner to
/// decide the batch's next status.
pub enum HealOutcome {
    Healed,
    NeedsAttention(RecoveryContext),
    Retry,
}

pub struct AutoHealer {
    launcher: Arc<dyn WorkflowLauncher>,
}

impl AutoHealer {
    pub fn new(launcher: Arc<dyn WorkflowLauncher>) -> Self {
        Self { launcher }
    }

    /// Runs one heal attempt for `batch`, per the procedure in spec section
    /// 4.5. `cumulative_healing_cost` is the cost already spent healing
    /// this execution; `failed_task_ids`/`completed_task_ids` and the
    /// `error_context` come from the just-failed implement invocation.
    pub async fn attempt(
        &self,
        project_dir: &Path,
        project_id: ProjectId,
        config: &OrchestratorConfig,
        batch: &mut BatchItem,
        completed_task_ids: &[String],
        failed_task_ids: &[String],
        error_context: &str,
        cumulative_healing_cost: f64,
    ) -> Result<HealOutcome> {
        if batch.heal_attempts >= config.max_heal_attempts
            || cumulative_healing_cost >= config.budget.healing_budget
        {
            return Ok(HealOutcome::NeedsAttention(RecoveryContext {
                issue: format!(
                    "batch '{}' exhausted heal attempts ({}/{}) or healing budget",
                    batch.section, batch.heal_attempts, config.max_heal_attempts
                ),
                options: vec![RecoveryAction::Retry, RecoveryAction::Skip, RecoveryAction::Abort],
            }));
        }

        let prompt = build_heal_prompt(
            &batch.section,
            &batch.task_ids,
            completed_task_ids,
            failed_task_ids,
            error_context,
        );

        let start = self
            .launcher
            .start(
                project_dir,
                project_id,
                "heal",
                &prompt,
                StartOptions::default(),
            )
            .await?;
        let execution = self.launcher.supervise(start.workflow_id).await?;

        if execution.status == crate::model::WorkflowStatus::Completed {
            batch.status = BatchStatus::Healed;
            batch.heal_attempts += 1;
            Ok(HealOutcome::Healed)
        } else {
            batch.heal_attempts += 1;
            Ok(HealOutcome::Retry)
        }
    }
}

fn build_heal_prompt(
    section: &str,
    attempted: &[String],
    completed: &[String],
    failed: &[String],
    error_context: &str,
) -> String {
    format!(
        "Heal batch '{section}'.\nAttempted tasks: {}\nCompleted: {}\nFailed: {}\nError context:\n{error_context}",
        attempted.join(", "),
        completed.join(", "),
        failed.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentOutput, OrchestratorConfig};
    use crate::workflow_executor::ScriptedLauncher;

    fn make_batch() -> BatchItem {
        BatchItem::new("B", vec!["T003".to_string()])
    }

    #[tokio::test]
    async fn heal_exhausted_surfaces_needs_attention() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let healer = AutoHealer::new(launcher);
        let mut config = OrchestratorConfig::default();
        config.max_heal_attempts = 1;
        let mut batch = make_batch();
        batch.heal_attempts = 1;

        let outcome = healer
            .attempt(
                Path::new("/tmp"),
                uuid::Uuid::new_v4(),
                &config,
                &mut batch,
                &[],
                &["T003".to_string()],
                "build failed",
                0.0,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, HealOutcome::NeedsAttention(_)));
    }

    #[tokio::test]
    async fn heal_success_marks_batch_healed() {
        let launcher = Arc::new(ScriptedLauncher::new());
        launcher
            .script(
                "heal",
                AgentOutput::Completed {
                    phase: None,
                    message: None,
                    artifacts: Vec::new(),
                },
            )
            .await;
        let healer = AutoHealer::new(launcher);
        let config = OrchestratorConfig::default();
        let mut batch = make_batch();

        let outcome = healer
            .attempt(
                Path::new("/tmp"),
                uuid::Uuid::new_v4(),
                &config,
                &mut batch,
                &[],
                &["T003".to_string()],
                "build failed",
                0.0,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, HealOutcome::Healed));
        assert_eq!(batch.status, BatchStatus::Healed);
        assert_eq!(batch.heal_attempts, 1);
    }

    #[tokio::test]
    async fn healing_budget_exhaustion_surfaces_needs_attention() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let healer = AutoHealer::new(launcher);
        let mut config = OrchestratorConfig::default();
        config.budget.healing_budget = 1.0;
        let mut batch = make_batch();

        let outcome = healer
            .attempt(
                Path::new("/tmp"),
                uuid::Uuid::new_v4(),
                &config,
                &mut batch,
                &[],
                &["T003".to_string()],
                "build failed",
                1.5,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, HealOutcome::NeedsAttention(_)));
    }
}
