//! Captures questions the agent emits in its structured output, associates
//! them with the originating workflow, and exposes them for answering.
//!
//! Storage mirrors the teacher's in-memory-map-plus-mutex convention for
//! the subprocess/question table (spec section 5: "in-memory, protected by
//! an internal mutex"), persisted to a per-project JSON file using the
//! same atomic-write helper `persistent_state.rs` defines, without the
//! `fsync` requirement (durability across power loss is explicitly not
//! required here per spec section 4.3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{ProjectId, Question, WorkflowId};

const STATE_DIR: &str = ".specflow";
const QUESTIONS_FILE: &str = "questions.json";

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct QuestionRecord {
    workflow_id: WorkflowId,
    question: Question,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct ProjectQuestions {
    #[serde(default)]
    records: Vec<QuestionRecord>,
}

pub struct QuestionQueue {
    projects: Mutex<HashMap<ProjectId, ProjectQuestions>>,
}

impl Default for QuestionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl QuestionQueue {
    pub fn new() -> Self {
        Self {
            projects: Mutex::new(HashMap::new()),
        }
    }

    fn questions_path(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR).join(QUESTIONS_FILE)
    }

    async fn load_into_cache(&self, project_dir: &Path, project_id: ProjectId) -> Result<()> {
        let mut projects = self.projects.lock().await;
        if projects.contains_key(&project_id) {
            return Ok(());
        }

        let path = Self::questions_path(project_dir);
        let on_disk: ProjectQuestions = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ProjectQuestions::default(),
            Err(err) => return Err(Error::Io(err)),
        };
        projects.insert(project_id, on_disk);
        Ok(())
    }

    async fn persist(&self, project_dir: &Path, project_id: ProjectId) -> Result<()> {
        let projects = self.projects.lock().await;
        let Some(state) = projects.get(&project_id) else {
            return Ok(());
        };
        let path = Self::questions_path(project_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(state).map_err(|source| Error::StateCorrupt { source })?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &bytes).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// Idempotent on `question.id`: re-enqueueing an existing id is a no-op.
    pub async fn enqueue(
        &self,
        project_dir: &Path,
        project_id: ProjectId,
        workflow_id: WorkflowId,
        question: Question,
    ) -> Result<()> {
        self.load_into_cache(project_dir, project_id).await?;

        {
            let mut projects = self.projects.lock().await;
            let state = projects.entry(project_id).or_default();
            if state
                .records
                .iter()
                .any(|record| record.question.id == question.id)
            {
                return Ok(());
            }
            state.records.push(QuestionRecord {
                workflow_id,
                question,
            });
        }

        self.persist(project_dir, project_id).await
    }

    /// Unanswered questions, in FIFO order (insertion order is preserved by
    /// the backing `Vec`, matching the append-only enqueue above).
    pub async fn pending(&self, project_dir: &Path, project_id: ProjectId) -> Result<Vec<Question>> {
        self.load_into_cache(project_dir, project_id).await?;
        let projects = self.projects.lock().await;
        Ok(projects
            .get(&project_id)
            .map(|state| {
                state
                    .records
                    .iter()
                    .filter(|record| record.question.is_pending())
                    .map(|record| record.question.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn answer(
        &self,
        project_dir: &Path,
        project_id: ProjectId,
        question_id: &str,
        answer: String,
    ) -> Result<()> {
        self.load_into_cache(project_dir, project_id).await?;

        {
            let mut projects = self.projects.lock().await;
            let state = projects.entry(project_id).or_default();
            let record = state
                .records
                .iter_mut()
                .find(|record| record.question.id == question_id)
                .ok_or_else(|| Error::UnknownQuestion {
                    question_id: question_id.to_string(),
                })?;
            if record.question.answer.is_some() {
                return Err(Error::AlreadyAnswered {
                    question_id: question_id.to_string(),
                });
            }
            record.question.answer = Some(answer);
        }

        self.persist(project_dir, project_id).await
    }

    /// Atomically returns and removes all answers for a workflow. Used at
    /// resume time to inject answers back into the next invocation.
    pub async fn drain(
        &self,
        project_dir: &Path,
        project_id: ProjectId,
        workflow_id: WorkflowId,
    ) -> Result<HashMap<String, String>> {
        self.load_into_cache(project_dir, project_id).await?;

        let drained = {
            let mut projects = self.projects.lock().await;
            let state = projects.entry(project_id).or_default();
            let mut drained = HashMap::new();
            state.records.retain(|record| {
                if record.workflow_id != workflow_id {
                    return true;
                }
                if let Some(answer) = &record.question.answer {
                    drained.insert(record.question.id.clone(), answer.clone());
                    false
                } else {
                    true
                }
            });
            drained
        };

        self.persist(project_dir, project_id).await?;
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn make_question(id: &str) -> Question {
        Question {
            id: id.to_string(),
            content: "Use REST or gRPC?".to_string(),
            options: None,
            answer: None,
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_on_id() {
        let dir = tempfile::tempdir().unwrap();
        let queue = QuestionQueue::new();
        let project_id = Uuid::new_v4();
        let workflow_id = Uuid::new_v4();

        queue
            .enqueue(dir.path(), project_id, workflow_id, make_question("q1"))
            .await
            .unwrap();
        queue
            .enqueue(dir.path(), project_id, workflow_id, make_question("q1"))
            .await
            .unwrap();

        let pending = queue.pending(dir.path(), project_id).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn answer_unknown_question_fails() {
        let dir = tempfile::tempdir().unwrap();
        let queue = QuestionQueue::new();
        let project_id = Uuid::new_v4();

        let err = queue
            .answer(dir.path(), project_id, "ghost", "REST".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownQuestion { .. }));
    }

    #[tokio::test]
    async fn answering_twice_fails_with_already_answered() {
        let dir = tempfile::tempdir().unwrap();
        let queue = QuestionQueue::new();
        let project_id = Uuid::new_v4();
        let workflow_id = Uuid::new_v4();
        queue
            .enqueue(dir.path(), project_id, workflow_id, make_question("q1"))
            .await
            .unwrap();

        queue
            .answer(dir.path(), project_id, "q1", "REST".to_string())
            .await
            .unwrap();
        let err = queue
            .answer(dir.path(), project_id, "q1", "gRPC".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyAnswered { .. }));
    }

    #[tokio::test]
    async fn drain_removes_answered_questions_for_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let queue = QuestionQueue::new();
        let project_id = Uuid::new_v4();
        let workflow_id = Uuid::new_v4();
        queue
            .enqueue(dir.path(), project_id, workflow_id, make_question("q1"))
            .await
            .unwrap();
        queue
            .answer(dir.path(), project_id, "q1", "REST".to_string())
            .await
            .unwrap();

        let drained = queue.drain(dir.path(), project_id, workflow_id).await.unwrap();
        assert_eq!(drained.get("q1"), Some(&"REST".to_string()));

        let pending = queue.pending(dir.path(), project_id).await.unwrap();
        assert!(pending.is_empty());
    }
}
