//! Append-only JSON Lines log of granted passes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use passgate_core::source::NotifyError;
use passgate_core::{NotificationSink, PassRecord};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Writes one JSON object per granted pass.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    // Serializes appends from concurrent sessions.
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NotificationSink for JsonlSink {
    async fn notify(&self, record: &PassRecord) -> Result<(), NotifyError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        tracing::debug!(path = %self.path.display(), identity = %record.identity, "pass appended to audit log");
        Ok(())
    }
}
