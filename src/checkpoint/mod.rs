//! Durable pipeline snapshots.
//!
//! One self-describing JSON document per snapshot, written under
//! `<root>/<project_id>/`. Files are written whole to a temporary name and
//! renamed into place, so a half-written file can never be mistaken for
//! "latest". Retention keeps at most `max_checkpoints` per project, oldest
//! pruned after each save. Callers treat persistence as best-effort: an
//! I/O failure here forfeits resumability for one interval, never the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::core::errors::{ForemanError, Result};
use crate::state::{PipelineState, Stage};

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Root directory holding one subdirectory per project.
    pub root: PathBuf,
    /// Snapshots retained per project.
    pub max_checkpoints: usize,
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_checkpoints == 0 {
            return Err(ForemanError::configuration(
                "max_checkpoints cannot be zero",
            ));
        }
        Ok(())
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("checkpoints"),
            max_checkpoints: 5,
        }
    }
}

/// A complete snapshot: enough to resume the orchestrator and the full
/// mutated pipeline state, not just the stage cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub current_stage: Stage,
    pub stage_history: Vec<Stage>,
    pub pipeline_state: PipelineState,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

pub struct CheckpointStore {
    config: CheckpointConfig,
    project_id: String,
    sequence: AtomicU64,
}

impl CheckpointStore {
    pub fn new<P: Into<String>>(config: CheckpointConfig, project_id: P) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            project_id: project_id.into(),
            sequence: AtomicU64::new(0),
        })
    }

    fn project_dir(&self) -> PathBuf {
        self.config.root.join(&self.project_id)
    }

    /// Write one snapshot, then prune beyond the retention limit.
    pub async fn save(
        &self,
        current_stage: Stage,
        stage_history: Vec<Stage>,
        pipeline_state: PipelineState,
        metadata: HashMap<String, Value>,
    ) -> Result<PathBuf> {
        let dir = self.project_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ForemanError::io(format!("create checkpoint dir {:?}", dir), e))?;

        let checkpoint = Checkpoint {
            timestamp: Utc::now(),
            project_id: self.project_id.clone(),
            current_stage,
            stage_history,
            pipeline_state,
            metadata,
        };
        let serialized = serde_json::to_vec_pretty(&checkpoint)?;

        // Millisecond timestamp plus a per-store sequence keeps filenames
        // strictly ordered even within one millisecond.
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let name = format!(
            "checkpoint_{:020}_{:06}.json",
            checkpoint.timestamp.timestamp_millis(),
            sequence
        );
        let final_path = dir.join(&name);
        let tmp_path = dir.join(format!("{}.tmp", name));

        tokio::fs::write(&tmp_path, &serialized)
            .await
            .map_err(|e| ForemanError::io(format!("write checkpoint {:?}", tmp_path), e))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| ForemanError::io(format!("publish checkpoint {:?}", final_path), e))?;

        debug!(path = ?final_path, stage = %current_stage, "Saved checkpoint");
        self.prune(&dir).await?;
        Ok(final_path)
    }

    /// Most recent snapshot that reads and parses, or `None`. Unreadable
    /// and corrupt files are skipped with a warning so a torn write never
    /// masks an older good snapshot.
    pub async fn load_latest(&self) -> Result<Option<Checkpoint>> {
        let dir = self.project_dir();
        let mut names = match list_checkpoint_files(&dir).await {
            Ok(names) => names,
            Err(_) => return Ok(None),
        };
        names.sort();
        for name in names.iter().rev() {
            let path = dir.join(name);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Skipping unreadable checkpoint");
                    continue;
                }
            };
            match serde_json::from_slice::<Checkpoint>(&bytes) {
                Ok(checkpoint) => {
                    info!(path = ?path, stage = %checkpoint.current_stage, "Loaded checkpoint");
                    return Ok(Some(checkpoint));
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "Skipping unparsable checkpoint");
                }
            }
        }
        Ok(None)
    }

    pub async fn count(&self) -> usize {
        list_checkpoint_files(&self.project_dir())
            .await
            .map(|names| names.len())
            .unwrap_or(0)
    }

    async fn prune(&self, dir: &Path) -> Result<()> {
        let mut names = list_checkpoint_files(dir).await?;
        if names.len() <= self.config.max_checkpoints {
            return Ok(());
        }
        names.sort();
        let excess = names.len() - self.config.max_checkpoints;
        for name in names.into_iter().take(excess) {
            let path = dir.join(&name);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = ?path, error = %e, "Failed to prune checkpoint");
            } else {
                debug!(path = ?path, "Pruned checkpoint");
            }
        }
        Ok(())
    }
}

async fn list_checkpoint_files(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| ForemanError::io(format!("read checkpoint dir {:?}", dir), e))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ForemanError::io("iterate checkpoint dir", e))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("checkpoint_") && name.ends_with(".json") {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir, max_checkpoints: usize) -> CheckpointStore {
        CheckpointStore::new(
            CheckpointConfig {
                root: dir.path().to_path_buf(),
                max_checkpoints,
            },
            "proj-1",
        )
        .unwrap()
    }

    fn state() -> PipelineState {
        PipelineState::new("proj", "demo")
    }

    #[tokio::test]
    async fn test_save_then_load_latest_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 5);

        let mut pipeline = state();
        pipeline.add_artifact("spec", "artifacts/spec.md");
        let metadata = HashMap::from([("note".to_string(), json!("boundary"))]);
        store
            .save(
                Stage::Development,
                vec![Stage::Initialization, Stage::RequirementAnalysis],
                pipeline.clone(),
                metadata,
            )
            .await
            .unwrap();

        let loaded = store.load_latest().await.unwrap().unwrap();
        assert_eq!(loaded.current_stage, Stage::Development);
        assert_eq!(
            loaded.stage_history,
            vec![Stage::Initialization, Stage::RequirementAnalysis]
        );
        assert_eq!(loaded.metadata["note"], json!("boundary"));
        assert_eq!(
            loaded.pipeline_state.to_json().unwrap(),
            pipeline.to_json().unwrap()
        );
    }

    #[tokio::test]
    async fn test_load_latest_returns_nth_save() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        for i in 0..4 {
            let mut pipeline = state();
            pipeline.add_artifact("seq", &format!("{}", i));
            store
                .save(Stage::Development, vec![], pipeline, HashMap::new())
                .await
                .unwrap();
        }
        let latest = store.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.pipeline_state.artifacts["seq"], "3");
    }

    #[tokio::test]
    async fn test_retention_prunes_oldest() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 3);
        for _ in 0..7 {
            store
                .save(Stage::Testing, vec![], state(), HashMap::new())
                .await
                .unwrap();
        }
        assert_eq!(store.count().await, 3);
    }

    #[tokio::test]
    async fn test_empty_store_loads_none() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 3);
        assert!(store.load_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_latest_falls_back_to_previous() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 5);
        let mut pipeline = state();
        pipeline.add_artifact("good", "yes");
        store
            .save(Stage::Development, vec![], pipeline, HashMap::new())
            .await
            .unwrap();

        // A newer file that never finished writing correctly.
        let corrupt = dir
            .path()
            .join("proj-1")
            .join("checkpoint_99999999999999999999_000000.json");
        tokio::fs::write(&corrupt, b"{ not json").await.unwrap();

        let loaded = store.load_latest().await.unwrap().unwrap();
        assert_eq!(loaded.pipeline_state.artifacts["good"], "yes");
    }

    #[tokio::test]
    async fn test_unreadable_latest_falls_back_to_previous() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 5);
        let mut pipeline = state();
        pipeline.add_artifact("good", "yes");
        store
            .save(Stage::Development, vec![], pipeline, HashMap::new())
            .await
            .unwrap();

        // A newer entry that cannot be read as a file at all.
        let unreadable = dir
            .path()
            .join("proj-1")
            .join("checkpoint_99999999999999999999_000001.json");
        tokio::fs::create_dir_all(&unreadable).await.unwrap();

        let loaded = store.load_latest().await.unwrap().unwrap();
        assert_eq!(loaded.pipeline_state.artifacts["good"], "yes");
    }
}
