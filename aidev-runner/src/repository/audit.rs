//! Audit log repository
//!
//! Append-only JSON lines, one `AuditEvent` per line.

use aidev_core::domain::audit::AuditEvent;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::CollabResult;

/// Repository trait for the audit trail
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> CollabResult<()>;

    /// Records `event`, logging instead of failing when the write fails
    ///
    /// Audit writes never stop a run.
    async fn emit(&self, event: AuditEvent) {
        debug!("audit: {:?}", event.kind);
        if let Err(e) = self.record(&event).await {
            warn!("Failed to write audit event for run {:?}: {}", event.run_id, e);
        }
    }
}

/// JSON lines file implementation of AuditLog
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditLog {
    /// Opens `<state_dir>/audit.jsonl` for appending
    pub async fn open(state_dir: &Path) -> CollabResult<Self> {
        tokio::fs::create_dir_all(state_dir).await?;
        let path = state_dir.join("audit.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn record(&self, event: &AuditEvent) -> CollabResult<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aidev_core::domain::audit::AuditKind;
    use aidev_core::domain::run::RunState;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_events_are_appended_as_lines() {
        let dir = TempDir::new().unwrap();
        let log = JsonlAuditLog::open(dir.path()).await.unwrap();
        let run_id = Uuid::new_v4();

        log.emit(AuditEvent::for_run(
            run_id,
            AuditKind::Transition {
                from: RunState::Queued,
                to: RunState::Planning,
                note: "admitted".to_string(),
            },
        ))
        .await;
        log.emit(AuditEvent::for_run(run_id, AuditKind::Dismissed)).await;

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "transition");
        assert_eq!(lines[1]["event"], "dismissed");
        assert_eq!(lines[1]["run_id"], run_id.to_string());
    }
}
