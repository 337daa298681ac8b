//! Durable security event sinks

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use turnstile::{EventSink, SecurityEvent, SinkError};

/// Appends each event as one JSON line
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(JsonLinesSink {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for JsonLinesSink {
    async fn record(&self, event: &SecurityEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Discards events; they still reach the tracing output through the emitter
pub struct DiscardSink;

#[async_trait]
impl EventSink for DiscardSink {
    async fn record(&self, _event: &SecurityEvent) -> Result<(), SinkError> {
        Ok(())
    }
}
