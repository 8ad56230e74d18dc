//! Checkpoint repository
//!
//! One JSON document per run under `<state_dir>/runs/`. Writes go to a
//! temporary file first and are renamed into place, so a crash leaves
//! either the previous checkpoint or the new one. Finished runs are moved
//! to `<state_dir>/archive/` and are not loaded on recovery.

use aidev_core::domain::run::PipelineRun;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::CollabResult;

/// Repository trait for durable run checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists the full run, replacing any previous checkpoint
    async fn save(&self, run: &PipelineRun) -> CollabResult<()>;

    async fn load(&self, id: Uuid) -> CollabResult<Option<PipelineRun>>;

    /// Every live (non-archived) run
    async fn load_all(&self) -> CollabResult<Vec<PipelineRun>>;

    /// Moves a run out of the live set
    async fn archive(&self, id: Uuid) -> CollabResult<()>;
}

/// Filesystem implementation of CheckpointStore
pub struct FileCheckpointStore {
    runs_dir: PathBuf,
    archive_dir: PathBuf,
}

impl FileCheckpointStore {
    /// Opens (creating if needed) the store under `state_dir`
    pub async fn open(state_dir: &Path) -> CollabResult<Self> {
        let runs_dir = state_dir.join("runs");
        let archive_dir = state_dir.join("archive");
        tokio::fs::create_dir_all(&runs_dir).await?;
        tokio::fs::create_dir_all(&archive_dir).await?;
        Ok(Self {
            runs_dir,
            archive_dir,
        })
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.runs_dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, run: &PipelineRun) -> CollabResult<()> {
        let path = self.path_for(run.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(run)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        // Durable before the rename makes it visible
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Checkpointed run {} at {} (seq {})", run.id, run.state, run.checkpoint_seq);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> CollabResult<Option<PipelineRun>> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> CollabResult<Vec<PipelineRun>> {
        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<PipelineRun>(&bytes) {
                Ok(run) => runs.push(run),
                Err(e) => warn!("Skipping unreadable checkpoint {}: {}", path.display(), e),
            }
        }

        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn archive(&self, id: Uuid) -> CollabResult<()> {
        let from = self.path_for(id);
        let to = self.archive_dir.join(format!("{}.json", id));
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => {
                debug!("Archived run {}", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
