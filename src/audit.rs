//! Append-only audit log of transfer events
//!
//! One line per event: `[<ISO-8601 timestamp>] <message>`. Lines are never
//! rewritten. A failed write is reported through tracing and does not abort
//! the transfer.

use crate::events::TransferEvent;

use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// File-backed audit sink
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Open (or create) the audit file for appending
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

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

    /// Mirror an event to the audit file and the tracing log
    pub async fn record(&self, event: &TransferEvent) {
        let message = event.message();
        if event.is_problem() {
            warn!(event = event.name(), transfer_id = ?event.transfer_id(), "{}", message);
        } else {
            info!(event = event.name(), transfer_id = ?event.transfer_id(), "{}", message);
        }

        if let Err(e) = self.append(&message).await {
            error!("Failed to write audit log {:?}: {}", self.path, e);
        }
    }

    async fn append(&self, message: &str) -> std::io::Result<()> {
        let line = format_line(&Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true), message);
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

fn format_line(timestamp: &str, message: &str) -> String {
    // Keep one event per line even if a detail string carries newlines
    format!("[{}] {}\n", timestamp, message.replace('\n', " "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[tokio::test]
    async fn test_lines_are_timestamped_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("transfers.log");

        let log = AuditLog::open(&path).await.unwrap();
        log.record(&TransferEvent::Rejected {
            reason: "Source and destination chains must be different".to_string(),
        })
        .await;
        drop(log);

        let log = AuditLog::open(&path).await.unwrap();
        log.record(&TransferEvent::Rejected {
            reason: "second".to_string(),
        })
        .await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let pattern =
            Regex::new(r"^\[\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}Z\] Rejected transfer request: .+$")
                .unwrap();
        assert!(lines.iter().all(|line| pattern.is_match(line)), "{:?}", lines);
        assert!(lines[1].ends_with("second"));
    }

    #[test]
    fn test_multiline_details_stay_on_one_line() {
        let line = format_line("2024-01-01T00:00:00.000Z", "a\nb");
        assert_eq!(line, "[2024-01-01T00:00:00.000Z] a b\n");
    }
}
