//! Audit trail — immutable JSONL records for every intercepted request.
//!
//! The interceptor only ever sees the audit sink as a callback; the
//! [`AuditLogger`] here is the host-side collaborator that accepts records
//! on a bounded channel and appends them to a JSONL file from a background
//! task. A full channel drops the record with a warning rather than adding
//! latency to the interception path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::analysis::{AnalysisResult, Verdict};
use crate::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 1024;

/// Immutable audit log record, one JSONL line each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub agent_id: String,
    pub method: String,
    pub params_summary: String,
    pub analysis: AnalysisResult,
    pub verdict: Verdict,
    pub response_time_ms: f64,
}

impl AuditEntry {
    /// Serialize to a single newline-terminated JSONL line.
    pub fn to_jsonl(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec());
        line.push(b'\n');
        line
    }
}

/// Background JSONL writer with a bounded intake channel.
pub struct AuditLogger {
    path: PathBuf,
    tx: mpsc::Sender<AuditEntry>,
    rx: std::sync::Mutex<Option<mpsc::Receiver<AuditEntry>>>,
    writer: std::sync::Mutex<Option<JoinHandle<()>>>,
    written: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
            writer: std::sync::Mutex::new(None),
            written: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the sink and start the writer task.
    pub async fn start(&self) -> Result<()> {
        let Some(mut rx) = self.rx.lock().ok().and_then(|mut slot| slot.take()) else {
            return Err(Error::Audit("logger already started".to_string()));
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let written = Arc::clone(&self.written);
        let path = self.path.clone();
        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = file.write_all(&entry.to_jsonl()).await {
                    error!(path = %path.display(), error = %e, "audit write failed");
                    continue;
                }
                written.fetch_add(1, Ordering::Relaxed);
            }
            let _ = file.flush().await;
        });

        if let Ok(mut slot) = self.writer.lock() {
            *slot = Some(handle);
        }
        info!(path = %self.path.display(), "audit logger started");
        Ok(())
    }

    /// Queue an entry without blocking. Errors when the channel is full or
    /// the writer is gone; callers treat that as an observability failure,
    /// never a verdict change.
    pub fn try_log(&self, entry: AuditEntry) -> Result<()> {
        self.tx.try_send(entry).map_err(|e| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("audit entry dropped: {e}");
            Error::Audit(e.to_string())
        })
    }

    /// Number of entries flushed to disk so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Number of entries dropped at intake.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain queued entries, then stop the writer.
    pub async fn stop(&self) {
        let handle = self.writer.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            // Full channel capacity means the writer has consumed everything.
            let drained = tokio::time::timeout(std::time::Duration::from_secs(2), async {
                while self.tx.capacity() < CHANNEL_CAPACITY {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            })
            .await;
            if drained.is_err() {
                warn!("audit drain window elapsed with entries still queued");
            }
            handle.abort();
            let _ = handle.await;
        }
        info!(written = self.written(), "audit logger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ThreatLevel;
    use pretty_assertions::assert_eq;

    fn entry(method: &str) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            session_id: "s1".to_string(),
            agent_id: "a1".to_string(),
            method: method.to_string(),
            params_summary: "{}".to_string(),
            analysis: AnalysisResult::default(),
            verdict: Verdict::Allow,
            response_time_ms: 0.4,
        }
    }

    #[test]
    fn test_jsonl_line_shape() {
        let line = entry("tools/call").to_jsonl();
        assert_eq!(*line.last().unwrap(), b'\n');
        let value: serde_json::Value = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(value["method"], "tools/call");
        assert_eq!(value["verdict"], "ALLOW");
        assert_eq!(value["analysis"]["threat_level"], "NONE");
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_analysis_embeds_threat_level() {
        let mut e = entry("tools/call");
        e.analysis.threat_level = ThreatLevel::High;
        let line = e.to_jsonl();
        let value: serde_json::Value = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(value["analysis"]["threat_level"], "HIGH");
    }

    #[tokio::test]
    async fn test_writes_entries_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firewall.jsonl");
        let logger = AuditLogger::new(&path);
        logger.start().await.unwrap();

        logger.try_log(entry("tools/list")).unwrap();
        logger.try_log(entry("tools/call")).unwrap();

        // Give the writer a moment to flush, then stop.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        logger.stop().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["method"], "tools/list");
        assert_eq!(logger.written(), 2);
    }

    #[tokio::test]
    async fn test_double_start_errors() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path().join("a.jsonl"));
        logger.start().await.unwrap();
        assert!(logger.start().await.is_err());
        logger.stop().await;
    }
}
