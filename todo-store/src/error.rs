//! Error taxonomy shared by every layer of the store engine.
//!
//! Each error carries a machine-checkable [`ErrorKind`] and a human-actionable
//! suggestion so callers (CLI, handlers) can decide whether to retry, reconcile
//! or give up without parsing messages.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::TaskId;

/// Machine-checkable classification of a [`StoreError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Schema failure or semantic violation (cycle, bad reference, ...)
    Validation,
    /// Lock could not be acquired in time
    LockTimeout,
    /// Disk or permission failure
    Io,
    /// Checksum mismatch, the file was edited outside the engine
    Integrity,
    /// A migration step failed mid-chain
    MigrationFailed,
    /// Missing file, task or backup
    NotFound,
}

impl ErrorKind {
    /// Stable error code
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "E_VALIDATION",
            ErrorKind::LockTimeout => "E_LOCK_TIMEOUT",
            ErrorKind::Io => "E_IO",
            ErrorKind::Integrity => "E_INTEGRITY",
            ErrorKind::MigrationFailed => "E_MIGRATION_FAILED",
            ErrorKind::NotFound => "E_NOT_FOUND",
        }
    }

    /// Process exit code used by the `todo` binary
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Validation => 2,
            ErrorKind::LockTimeout => 3,
            ErrorKind::Io => 4,
            ErrorKind::Integrity => 5,
            ErrorKind::MigrationFailed => 6,
            ErrorKind::NotFound => 7,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("schema validation failed for {path:?} ({schema}): {}", .errors.join("; "))]
    SchemaInvalid {
        path: PathBuf,
        schema: String,
        errors: Vec<String>,
    },

    #[error("circular dependency: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<TaskId> },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("timed out after {timeout:?} waiting for lock on {path:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("lock on {path:?} is already held by this operation")]
    LockReentered { path: PathBuf },

    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("json encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("checksum mismatch in {path:?}: recorded {recorded}, actual {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        recorded: String,
        actual: String,
    },

    #[error("backup {id} is corrupt: {reason}")]
    BackupCorrupt { id: String, reason: String },

    #[error("migration of {path:?} failed at step {step}: {reason}")]
    MigrationFailed {
        path: PathBuf,
        step: String,
        reason: String,
    },

    #[error("no migration path for {file_type} from {from} to {to}: {reason}")]
    MigrationGap {
        file_type: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("{path:?} has schema version {found}, newer than supported {supported}")]
    VersionTooNew {
        path: PathBuf,
        found: String,
        supported: String,
    },

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("backup {0} not found")]
    BackupNotFound(String),

    #[error("{0:?} does not exist")]
    FileNotFound(PathBuf),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::SchemaInvalid { .. }
            | StoreError::CircularDependency { .. }
            | StoreError::InvalidOperation(_)
            | StoreError::LockReentered { .. }
            | StoreError::Parse { .. }
            | StoreError::Encode(_)
            | StoreError::VersionTooNew { .. } => ErrorKind::Validation,
            StoreError::LockTimeout { .. } => ErrorKind::LockTimeout,
            StoreError::Io { .. } => ErrorKind::Io,
            StoreError::ChecksumMismatch { .. } | StoreError::BackupCorrupt { .. } => {
                ErrorKind::Integrity
            }
            StoreError::MigrationFailed { .. } | StoreError::MigrationGap { .. } => {
                ErrorKind::MigrationFailed
            }
            StoreError::TaskNotFound(_)
            | StoreError::BackupNotFound(_)
            | StoreError::FileNotFound(_) => ErrorKind::NotFound,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::LockTimeout
    }

    /// What the operator should do next
    pub fn suggestion(&self) -> &'static str {
        match self {
            StoreError::SchemaInvalid { .. } => {
                "Fix the reported fields; the target file was left untouched"
            }
            StoreError::CircularDependency { .. } => {
                "Remove one of the dependencies in the reported cycle before adding this one"
            }
            StoreError::InvalidOperation(_) => "Check the arguments and the task's current state",
            StoreError::LockReentered { .. } => {
                "Use the already-held lock guard instead of acquiring the same path again"
            }
            StoreError::LockTimeout { .. } => {
                "Another process holds the store; retry, or raise TODO_STORE_LOCK_TIMEOUT_SECS"
            }
            StoreError::Io { .. } => "Check disk space and permissions on the store directory",
            StoreError::Parse { .. } | StoreError::Encode(_) => {
                "Restore a backup or repair the JSON by hand, then run `todo reconcile`"
            }
            StoreError::ChecksumMismatch { .. } => {
                "The file was edited outside the engine; review it, then run `todo reconcile`"
            }
            StoreError::BackupCorrupt { .. } => "Pick an older backup with `todo backup list`",
            StoreError::MigrationFailed { .. } => {
                "Restore the `migration` backup or fix the file and re-run `todo migrate`"
            }
            StoreError::MigrationGap { .. } => "Upgrade todo-store; its migration registry is incomplete",
            StoreError::VersionTooNew { .. } => "Upgrade todo-store to a version that knows this schema",
            StoreError::TaskNotFound(_) => "List tasks to find a valid id",
            StoreError::BackupNotFound(_) => "Run `todo backup list` to see available backup ids",
            StoreError::FileNotFound(_) => "Run `todo init` to create the store",
        }
    }
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
