//! Atomic write engine: lock -> temp file -> validate -> Tier 1 backup -> rename
//!
//! A reader of the target path sees either the complete old content or the
//! complete new content, never a mix. A crash before the rename leaves at most
//! an orphaned `.<name>.tmp.<pid>.<n>` file next to the target, which
//! [`cleanup_stale_temps`] sweeps later.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::backup;
use crate::error::{Result, StoreError};
use crate::lock::{LockGuard, LockManager, DEFAULT_LOCK_TIMEOUT};
use crate::validate::SchemaValidator;

/// Tier 1 ring size unless configured otherwise
pub const DEFAULT_MAX_OPERATIONAL_BACKUPS: usize = 10;

/// Temp files older than this are considered orphaned
pub const CLEANUP_AGE_THRESHOLD: Duration = Duration::from_secs(3600);

/// Maximum directory entries to scan during cleanup
pub const CLEANUP_SCAN_LIMIT: usize = 1000;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Writes store files crash-safely under the path's lock
pub struct AtomicWriter {
    locks: Arc<dyn LockManager>,
    validator: Arc<dyn SchemaValidator>,
    lock_timeout: Duration,
    max_operational_backups: usize,
}

impl AtomicWriter {
    pub fn new(locks: Arc<dyn LockManager>, validator: Arc<dyn SchemaValidator>) -> Self {
        Self {
            locks,
            validator,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_operational_backups: DEFAULT_MAX_OPERATIONAL_BACKUPS,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_max_operational_backups(mut self, keep: usize) -> Self {
        self.max_operational_backups = keep;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn validator(&self) -> &dyn SchemaValidator {
        self.validator.as_ref()
    }

    /// Acquire the lock for `path` with the configured timeout
    pub fn lock(&self, path: &Path) -> Result<LockGuard> {
        self.locks.acquire(path, self.lock_timeout)
    }

    /// Lock `path`, commit `content`, release
    pub fn write(&self, path: &Path, content: &[u8], schema: &str) -> Result<()> {
        let mut guard = self.lock(path)?;
        let result = self.write_locked(&guard, path, content, schema);
        guard.release();
        result
    }

    /// Commit `content` to `path` under a lock the caller already holds
    pub fn write_locked(
        &self,
        guard: &LockGuard,
        path: &Path,
        content: &[u8],
        schema: &str,
    ) -> Result<()> {
        if !guard.covers(path) {
            return Err(StoreError::InvalidOperation(format!(
                "lock held on {} does not cover {}",
                guard.path().display(),
                path.display()
            )));
        }

        let temp = TempFile::create(path, content)?;

        let written = fs::read(temp.path()).map_err(|e| StoreError::io(temp.path(), e))?;
        if let Err(errors) = self.validator.validate(&written, schema) {
            tracing::warn!(path = %path.display(), schema, "rejected write: {}", errors.join("; "));
            return Err(StoreError::SchemaInvalid {
                path: path.to_path_buf(),
                schema: schema.to_string(),
                errors,
            });
        }

        if path.exists() {
            backup::rotate_operational(path, self.max_operational_backups)?;
        }

        temp.persist(path)?;
        tracing::debug!(path = %path.display(), bytes = content.len(), "committed write");
        Ok(())
    }
}

/// Read a store file without locking; renames make torn reads impossible
pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StoreError::FileNotFound(path.to_path_buf()))
        }
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Durably place `content` at `path` (temp + fsync + rename) without lock or validation.
/// Used for immutable files such as Tier 2 backup copies.
pub(crate) fn persist_file(path: &Path, content: &[u8]) -> Result<()> {
    TempFile::create(path, content)?.persist(path)
}

/// Temp sibling of a target; removed on drop unless persisted
struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl TempFile {
    fn create(target: &Path, content: &[u8]) -> Result<Self> {
        let dir = parent_dir(target);
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                StoreError::InvalidOperation(format!("{} has no file name", target.display()))
            })?;
        let temp_name = format!(
            ".{}.tmp.{}.{}",
            name,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let temp = TempFile {
            path: dir.join(temp_name),
            persisted: false,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp.path)
            .map_err(|e| StoreError::io(&temp.path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(|e| StoreError::io(&temp.path, e))?;
        }

        file.write_all(content)
            .map_err(|e| StoreError::io(&temp.path, e))?;
        file.sync_all().map_err(|e| StoreError::io(&temp.path, e))?; // fsync
        Ok(temp)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persist(mut self, target: &Path) -> Result<()> {
        fs::rename(&self.path, target).map_err(|e| StoreError::io(target, e))?;
        self.persisted = true;
        sync_dir(parent_dir(target))
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.persisted {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), "failed to remove temp file: {}", e);
                }
            }
        }
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Make a rename durable by syncing its directory entry
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StoreError::io(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Outcome of a stale temp sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub scanned: usize,
    pub hit_limit: bool,
}

/// Delete `*.tmp.*` files older than [`CLEANUP_AGE_THRESHOLD`] under `dir`.
/// Scans at most [`CLEANUP_SCAN_LIMIT`] files to keep startup fast.
pub fn cleanup_stale_temps(dir: &Path) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    if !dir.exists() {
        return Ok(report);
    }
    let now = SystemTime::now();

    for entry in walkdir::WalkDir::new(dir)
        .max_depth(3) // <dir>/backups/<type>/<file>
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if report.scanned >= CLEANUP_SCAN_LIMIT {
            tracing::warn!(
                dir = %dir.display(),
                limit = CLEANUP_SCAN_LIMIT,
                "hit cleanup scan limit"
            );
            report.hit_limit = true;
            return Ok(report);
        }

        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        report.scanned += 1;

        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(".tmp."));
        if !is_temp {
            continue;
        }

        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > CLEANUP_AGE_THRESHOLD) {
            match fs::remove_file(path) {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "failed to delete stale temp file: {}", e)
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{FileLockManager, MemoryLockManager};
    use crate::validate::NoopValidator;
    use filetime::FileTime;
    use tempfile::TempDir;

    struct RejectAll;

    impl SchemaValidator for RejectAll {
        fn validate(&self, _content: &[u8], _schema: &str) -> std::result::Result<(), Vec<String>> {
            Err(vec!["rejected".to_string()])
        }
    }

    struct CrashOnValidate;

    impl SchemaValidator for CrashOnValidate {
        fn validate(&self, _content: &[u8], _schema: &str) -> std::result::Result<(), Vec<String>> {
            panic!("process killed between temp write and rename");
        }
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".tmp."))
            .collect()
    }

    #[test]
    fn test_write_creates_file_and_tier1_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("todo.json");
        let writer = AtomicWriter::new(Arc::new(FileLockManager::new()), Arc::new(NoopValidator));

        writer.write(&path, b"{\"v\":1}", "todo").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"v\":1}");
        // Nothing to back up on first write
        assert!(!temp_dir.path().join(".backups").exists());

        writer.write(&path, b"{\"v\":2}", "todo").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"v\":2}");
        let backup = temp_dir.path().join(".backups").join("todo.json.1");
        assert_eq!(fs::read(backup).unwrap(), b"{\"v\":1}");
        assert!(temp_files(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_validation_failure_leaves_target_and_releases_lock() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("todo.json");
        fs::write(&path, b"original").unwrap();

        let locks = MemoryLockManager::new();
        let writer = AtomicWriter::new(Arc::new(locks.clone()), Arc::new(RejectAll));

        let err = writer.write(&path, b"replacement", "todo").unwrap_err();
        assert!(matches!(err, StoreError::SchemaInvalid { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"original");
        assert!(temp_files(temp_dir.path()).is_empty());
        assert!(!locks.is_locked(&path));
        assert!(!temp_dir.path().join(".backups").exists());
    }

    #[test]
    fn test_crash_before_rename_keeps_target_intact() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("todo.json");
        fs::write(&path, b"before").unwrap();

        let locks = MemoryLockManager::new();
        let writer = AtomicWriter::new(Arc::new(locks.clone()), Arc::new(CrashOnValidate));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            writer.write(&path, b"after", "todo")
        }));
        assert!(result.is_err());
        assert_eq!(fs::read(&path).unwrap(), b"before");
        assert!(!locks.is_locked(&path));
    }

    #[test]
    fn test_write_locked_rejects_foreign_guard() {
        let temp_dir = TempDir::new().unwrap();
        let todo = temp_dir.path().join("todo.json");
        let archive = temp_dir.path().join("todo-archive.json");
        let writer = AtomicWriter::new(Arc::new(MemoryLockManager::new()), Arc::new(NoopValidator));

        let guard = writer.lock(&archive).unwrap();
        let err = writer.write_locked(&guard, &todo, b"{}", "todo").unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
        assert!(!todo.exists());

        writer.write_locked(&guard, &archive, b"{}", "archive").unwrap();
        assert!(archive.exists());
    }

    #[test]
    fn test_write_times_out_when_locked() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("todo.json");
        let locks = Arc::new(FileLockManager::new());
        let writer = AtomicWriter::new(locks.clone(), Arc::new(NoopValidator))
            .with_lock_timeout(Duration::from_millis(50));

        let holder = {
            let path = path.clone();
            std::thread::spawn(move || {
                let _guard = FileLockManager::new()
                    .acquire(&path, Duration::from_secs(1))
                    .unwrap();
                std::thread::sleep(Duration::from_millis(300));
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        let err = writer.write(&path, b"{}", "todo").unwrap_err();
        assert!(err.is_retryable());
        assert!(!path.exists());
        holder.join().unwrap();
    }

    #[test]
    fn test_read_bytes_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let err = read_bytes(&temp_dir.path().join("todo.json")).unwrap_err();
        assert!(matches!(err, StoreError::FileNotFound(_)));
    }

    #[test]
    fn test_cleanup_stale_temps() {
        let temp_dir = TempDir::new().unwrap();
        let stale = temp_dir.path().join(".todo.json.tmp.99999.0");
        let fresh = temp_dir.path().join(".todo.json.tmp.99999.1");
        let regular = temp_dir.path().join("todo.json");
        fs::write(&stale, "x").unwrap();
        fs::write(&fresh, "x").unwrap();
        fs::write(&regular, "{}").unwrap();

        let two_hours_ago = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(7200));
        filetime::set_file_mtime(&stale, two_hours_ago).unwrap();

        let report = cleanup_stale_temps(temp_dir.path()).unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.scanned, 3);
        assert!(!report.hit_limit);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(regular.exists());
    }
}
