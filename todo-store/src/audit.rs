//! Append-only audit log (todo-log.jsonl)
//!
//! One JSON object per line. Appends hold the log's own lock so lines from
//! concurrent processes never interleave; readers tolerate a damaged line.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::lock::LockManager;
use crate::model::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub before: Option<Value>,
    #[serde(default)]
    pub after: Option<Value>,
}

impl AuditEntry {
    pub fn new(action: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            action: action.into(),
            timestamp,
            task_id: None,
            before: None,
            after: None,
        }
    }

    pub fn task(mut self, id: &TaskId) -> Self {
        self.task_id = Some(id.clone());
        self
    }

    pub fn before(mut self, value: impl Serialize) -> Self {
        self.before = serde_json::to_value(value).ok();
        self
    }

    pub fn after(mut self, value: impl Serialize) -> Self {
        self.after = serde_json::to_value(value).ok();
        self
    }
}

pub struct AuditLog {
    path: PathBuf,
    locks: Arc<dyn LockManager>,
    lock_timeout: Duration,
}

impl AuditLog {
    pub fn new(path: PathBuf, locks: Arc<dyn LockManager>, lock_timeout: Duration) -> Self {
        Self {
            path,
            locks,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.locks.acquire(&self.path, self.lock_timeout)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.write_all(&line)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.sync_data().map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }

    /// All readable entries, oldest first
    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| StoreError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), line = n + 1, "skipping malformed audit entry: {}", e);
                }
            }
        }
        Ok(entries)
    }
}
