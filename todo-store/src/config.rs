// Store configuration: directory layout, lock timeout, backup retention
// Layered as defaults < user config.json < project config.json < environment

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::atomic::DEFAULT_MAX_OPERATIONAL_BACKUPS;
use crate::backup::{BackupKind, RetentionPolicy, RECOVERY_DIR, OPERATIONAL_DIR};
use crate::lock::DEFAULT_LOCK_TIMEOUT;

pub const TODO_FILE: &str = "todo.json";
pub const ARCHIVE_FILE: &str = "todo-archive.json";
pub const LOG_FILE: &str = "todo-log.jsonl";
pub const CONFIG_FILE: &str = "config.json";

pub const ENV_STORE_DIR: &str = "TODO_STORE_DIR";
pub const ENV_LOCK_TIMEOUT: &str = "TODO_STORE_LOCK_TIMEOUT_SECS";
pub const ENV_MAX_OPERATIONAL_BACKUPS: &str = "TODO_STORE_MAX_OPERATIONAL_BACKUPS";

/// Days a finished task stays in the active store before compaction archives it
pub const DEFAULT_ARCHIVE_RETENTION_DAYS: u32 = 7;

/// Resolved settings for one store directory
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Directory holding todo.json and its companions
    pub store_dir: PathBuf,
    pub lock_timeout: Duration,
    /// Tier 1 ring size
    pub max_operational_backups: usize,
    pub archive_retention_days: u32,
    /// Tier 2 retention overrides; types not listed use their defaults
    pub retention: BTreeMap<BackupKind, RetentionPolicy>,
}

/// On-disk shape of config.json; every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileConfig {
    lock_timeout_secs: Option<u64>,
    max_operational_backups: Option<usize>,
    archive_retention_days: Option<u32>,
    #[serde(default)]
    retention: BTreeMap<BackupKind, RetentionPolicy>,
}

impl StoreConfig {
    /// Built-in defaults for `store_dir`, no files or environment consulted
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_operational_backups: DEFAULT_MAX_OPERATIONAL_BACKUPS,
            archive_retention_days: DEFAULT_ARCHIVE_RETENTION_DAYS,
            retention: BTreeMap::new(),
        }
    }

    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let store_dir = std::env::var(ENV_STORE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_store_dir());
        Self::load(store_dir, |key| std::env::var(key).ok())
    }

    /// Resolve every layer for `store_dir`; `env` looks up environment overrides
    pub fn load(store_dir: impl Into<PathBuf>, env: impl Fn(&str) -> Option<String>) -> Self {
        Self::load_layers(store_dir, Self::user_config_file().as_deref(), env)
    }

    fn load_layers(
        store_dir: impl Into<PathBuf>,
        user_file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut config = Self::new(store_dir);
        if let Some(user_file) = user_file {
            config.apply_file(user_file);
        }
        let project_file = config.config_file();
        config.apply_file(&project_file);
        config.apply_env(env);
        config
    }

    /// `./.todo` under the current directory
    fn default_store_dir() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".todo")
    }

    /// Per-user defaults, e.g. ~/.config/todo-store/config.json
    fn user_config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("todo-store").join(CONFIG_FILE))
    }

    /// Merge a config.json if present; a broken file is reported and skipped
    fn apply_file(&mut self, path: &Path) {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(path = %path.display(), "failed to read config: {}", e);
                return;
            }
        };
        let file: FileConfig = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring invalid config: {}", e);
                return;
            }
        };

        if let Some(secs) = file.lock_timeout_secs {
            self.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(keep) = file.max_operational_backups {
            self.max_operational_backups = keep;
        }
        if let Some(days) = file.archive_retention_days {
            self.archive_retention_days = days;
        }
        self.retention.extend(file.retention);
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(secs) = parse_env(&env, ENV_LOCK_TIMEOUT) {
            self.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(keep) = parse_env(&env, ENV_MAX_OPERATIONAL_BACKUPS) {
            self.max_operational_backups = keep;
        }
    }

    /// Retention for `kind`, falling back to its default
    pub fn retention_for(&self, kind: BackupKind) -> RetentionPolicy {
        self.retention
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_retention())
    }

    pub fn todo_file(&self) -> PathBuf {
        self.store_dir.join(TODO_FILE)
    }

    pub fn archive_file(&self) -> PathBuf {
        self.store_dir.join(ARCHIVE_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.store_dir.join(LOG_FILE)
    }

    pub fn config_file(&self) -> PathBuf {
        self.store_dir.join(CONFIG_FILE)
    }

    /// Tier 1 ring directory
    pub fn operational_backup_dir(&self) -> PathBuf {
        self.store_dir.join(OPERATIONAL_DIR)
    }

    /// Tier 2 directory for one backup type
    pub fn recovery_backup_dir(&self, kind: BackupKind) -> PathBuf {
        self.store_dir.join(RECOVERY_DIR).join(kind.as_str())
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.store_dir)
    }
}

fn parse_env<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
