//! Append-only audit log: one JSON record per line, keyed by session id.
//! Optional per configuration; failures to write are logged and swallowed
//! so auditing never breaks a turn.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub kind: String,
    pub detail: Value,
}

pub struct AuditLogger {
    path: PathBuf,
}

impl AuditLogger {
    pub fn new(logs_dir: impl AsRef<Path>) -> Self {
        Self { path: logs_dir.as_ref().join("audit.jsonl") }
    }

    pub fn record(&self, session_id: &str, kind: &str, detail: Value) {
        if let Err(err) = self.append(session_id, kind, detail) {
            warn!(?err, "audit append failed");
        }
    }

    fn append(&self, session_id: &str, kind: &str, detail: Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let record = AuditRecord {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            kind: kind.to_string(),
            detail,
        };
        let line = serde_json::to_string(&record).context("serialize audit record")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open audit log {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Load every record for one session, in append order.
    pub fn records_for(&self, session_id: &str) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<AuditRecord>(line.trim()).ok())
            .filter(|record| record.session_id == session_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_append_and_filter_by_session() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path());

        logger.record("s1", "message", json!({"content": "hi"}));
        logger.record("s2", "message", json!({"content": "other"}));
        logger.record("s1", "workflow", json!({"status": "completed"}));

        let records = logger.records_for("s1").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, "message");
        assert_eq!(records[1].detail["status"], "completed");
        assert!(logger.records_for("s3").unwrap().is_empty());
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path().join("nested"));
        assert!(logger.records_for("s").unwrap().is_empty());
    }
}
