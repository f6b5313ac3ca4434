//! Append-only JSON-lines audit log of executed steps and sweeps.
//!
//! Only outcomes are recorded. The target database's schema stays the single
//! source of truth; the log is never read back to decide what to do.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunLog {
    path: Option<PathBuf>,
    run_id: Uuid,
}

impl RunLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            run_id: Uuid::new_v4(),
        }
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends one entry. Write failures are logged and otherwise ignored so
    /// an unwritable audit file never stops a run.
    pub async fn append<T: Serialize>(&self, event: &str, tenant: &str, payload: &T) {
        let Some(path) = &self.path else {
            return;
        };

        let entry = json!({
            "run_id": self.run_id,
            "at": Utc::now(),
            "event": event,
            "tenant": tenant,
            "payload": payload,
        });

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            let mut line = entry.to_string();
            line.push('\n');
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!("Failed to append to run log {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let log = RunLog::new(Some(path.clone()));

        log.append("migration_step", "tenant-a", &json!({"applied": true}))
            .await;
        log.append("sweep", "tenant-a", &json!({"deleted": 2})).await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "migration_step");
        assert_eq!(lines[1]["payload"]["deleted"], 2);
        assert_eq!(lines[0]["run_id"], lines[1]["run_id"]);
    }

    #[tokio::test]
    async fn test_disabled_log_is_noop() {
        RunLog::disabled()
            .append("sweep", "tenant-a", &json!({}))
            .await;
    }
}
