//! The only durable source of truth for orchestration progress.
//!
//! Grounded on `OrchestratorStore` (teacher's `store.rs`): same
//! write-to-temp-then-rename idiom, hardened with an explicit `fsync`
//! before the rename, since this spec requires it where the teacher's
//! simpler version did not.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{Phase, PersistentState, ProjectId, StepStatus};

const STATE_DIR: &str = ".specflow";
const STATE_FILE: &str = "orchestration-state.json";

/// Loads, saves, and serializes mutation of one project's state file.
///
/// Holds a per-project lock table so that `Mutate` calls against different
/// projects never contend, matching the "exclusive per-project lock on
/// every mutation path" rule in spec section 5.
pub struct PersistentStateStore {
    locks: Mutex<HashMap<ProjectId, Arc<Mutex<()>>>>,
}

impl Default for PersistentStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentStateStore {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn state_path(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR).join(STATE_FILE)
    }

    async fn lock_for(&self, project_id: ProjectId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Reads without taking the per-project lock; callers get a
    /// point-in-time snapshot, exactly as spec section 4.1 permits.
    pub async fn load(&self, project_dir: &Path) -> Result<PersistentState> {
        let path = Self::state_path(project_dir);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ConfigInvalid {
                    reason: format!("no state file at {}", path.display()),
                });
            }
            Err(err) => return Err(Error::Io(err)),
        };

        let mut state: PersistentState =
            serde_json::from_slice(&bytes).map_err(|source| Error::StateCorrupt { source })?;

        if self.auto_repair(&mut state) {
            self.save(project_dir, &state).await?;
        }

        Ok(state)
    }

    /// Applies the auto-repair rules from spec section 4.1. Returns `true`
    /// if any field was repaired (the caller must then persist the fix and
    /// the decision-log entries it produced).
    fn auto_repair(&self, state: &mut PersistentState) -> bool {
        let mut repaired = false;

        if state.schema_version != crate::model::SCHEMA_VERSION {
            state.schema_version = crate::model::SCHEMA_VERSION.to_string();
            self.log_repair(state, "schema_version");
            repaired = true;
        }

        if Phase::from_name(&state.orchestration.step.current).is_none() {
            state.orchestration.step.current = "design".to_string();
            state.orchestration.step.status = StepStatus::NotStarted;
            self.log_repair(state, "step.current");
            repaired = true;
        }

        let expected_index = Phase::from_name(&state.orchestration.step.current)
            .and_then(Phase::index)
            .unwrap_or(0);
        if state.orchestration.step.index != expected_index {
            state.orchestration.step.index = expected_index;
            self.log_repair(state, "step.index");
            repaired = true;
        }

        repaired
    }

    fn log_repair(&self, state: &mut PersistentState, field: &str) {
        if let Some(execution) = state.orchestration.execution.as_mut() {
            execution.log_decision("auto-repaired", field);
        }
        tracing::warn!(field, "auto-repaired persisted state field");
    }

    /// Atomic write: write to a sibling temp file, `fsync`, then rename.
    /// Never partial-writes the live path.
    pub async fn save(&self, project_dir: &Path, state: &PersistentState) -> Result<()> {
        let path = Self::state_path(project_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut to_write = state.clone();
        to_write.last_updated = Utc::now();
        let bytes = serde_json::to_vec_pretty(&to_write).map_err(|source| Error::StateCorrupt { source })?;

        let tmp_path = path.with_extension("json.tmp");
        let file = fs::File::create(&tmp_path).await?;
        {
            use tokio::io::AsyncWriteExt;
            let mut file = file;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// Load, apply `f`, save — serialized by the per-project lock.
    pub async fn mutate<F>(&self, project_dir: &Path, project_id: ProjectId, f: F) -> Result<PersistentState>
    where
        F: FnOnce(&mut PersistentState),
    {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let mut state = self.load(project_dir).await?;
        f(&mut state);
        self.save(project_dir, &state).await?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProjectRef;
    use uuid::Uuid;

    fn make_project_ref(id: ProjectId) -> ProjectRef {
        ProjectRef {
            id,
            name: "demo".to_string(),
            path: "/tmp/demo".to_string(),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new();
        let project_id = Uuid::new_v4();
        let state = PersistentState::new(make_project_ref(project_id));

        store.save(dir.path(), &state).await.unwrap();
        let loaded = store.load(dir.path()).await.unwrap();

        assert_eq!(loaded.schema_version, crate::model::SCHEMA_VERSION);
        assert_eq!(loaded.project.id, project_id);
    }

    #[tokio::test]
    async fn load_missing_file_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new();
        let err = store.load(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn load_invalid_json_is_state_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join(".specflow");
        tokio::fs::create_dir_all(&state_dir).await.unwrap();
        tokio::fs::write(state_dir.join("orchestration-state.json"), b"not json")
            .await
            .unwrap();

        let store = PersistentStateStore::new();
        let err = store.load(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::StateCorrupt { .. }));
    }

    #[tokio::test]
    async fn auto_repair_normalizes_unknown_step_and_logs_decision() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new();
        let project_id = Uuid::new_v4();
        let mut state = PersistentState::new(make_project_ref(project_id));
        state.orchestration.step.current = "bogus".to_string();
        state.orchestration.step.index = 99;
        store.save(dir.path(), &state).await.unwrap();

        let loaded = store.load(dir.path()).await.unwrap();
        assert_eq!(loaded.orchestration.step.current, "design");
        assert_eq!(loaded.orchestration.step.index, 0);
    }

    #[tokio::test]
    async fn auto_repair_normalizes_index_persisted_as_json_string() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new();
        let project_id = Uuid::new_v4();
        let state = PersistentState::new(make_project_ref(project_id));
        store.save(dir.path(), &state).await.unwrap();

        let path = dir.path().join(".specflow").join("orchestration-state.json");
        let mut value: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        value["orchestration"]["step"]["index"] = serde_json::Value::String("2".to_string());
        tokio::fs::write(&path, serde_json::to_vec(&value).unwrap())
            .await
            .unwrap();

        let loaded = store.load(dir.path()).await.unwrap();
        assert_eq!(loaded.orchestration.step.index, 0);
    }

    #[tokio::test]
    async fn mutate_applies_fn_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new();
        let project_id = Uuid::new_v4();
        let state = PersistentState::new(make_project_ref(project_id));
        store.save(dir.path(), &state).await.unwrap();

        store
            .mutate(dir.path(), project_id, |s| {
                s.orchestration.dashboard.active = true;
            })
            .await
            .unwrap();

        let loaded = store.load(dir.path()).await.unwrap();
        assert!(loaded.orchestration.dashboard.active);
    }
}
