//! Lock manager: advisory, per-path, timeout-bounded locks
//!
//! Locks are keyed by the absolute path of the data file they protect.
//! [`FileLockManager`] takes an OS advisory lock (flock / LockFileEx via fs2) on
//! a sibling `<file>.lock`, which cooperates across processes on one host but is
//! not guaranteed on network filesystems. [`MemoryLockManager`] is the in-process
//! fake used by tests.
//!
//! Acquisition is scoped: the returned [`LockGuard`] releases on drop, so every
//! exit path of the holder (including `?` and panics) gives the lock back.
//! Acquiring a path the current thread already holds is reported as
//! [`StoreError::LockReentered`] instead of deadlocking.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{Result, StoreError};

/// Default wait before a lock acquisition is abandoned
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Abstract lock interface injected into the atomic write engine
pub trait LockManager: Send + Sync {
    /// Acquire the lock for `path`, waiting at most `timeout`
    fn acquire(&self, path: &Path, timeout: Duration) -> Result<LockGuard>;
}

/// Something that can give a lock back exactly once
trait HeldLock: Send {
    fn unlock(self: Box<Self>);
}

/// Token for a held lock; released on drop
pub struct LockGuard {
    key: PathBuf,
    held: Option<Box<dyn HeldLock>>,
}

impl LockGuard {
    fn new(key: PathBuf, held: Box<dyn HeldLock>) -> Self {
        Self {
            key,
            held: Some(held),
        }
    }

    /// Absolute path this guard protects
    pub fn path(&self) -> &Path {
        &self.key
    }

    /// Whether this guard is for `path` and still held
    pub fn covers(&self, path: &Path) -> bool {
        self.held.is_some() && lock_key(path) == self.key
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Release the lock. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(held) = self.held.take() {
            held.unlock();
            tracing::debug!(path = %self.key.display(), "lock released");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.key)
            .field("held", &self.held.is_some())
            .finish()
    }
}

/// Absolute, normalized key for a data path (the file itself may not exist yet)
pub fn lock_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        if let Ok(dir) = parent.canonicalize() {
            return dir.join(name);
        }
    }
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Path of the sibling lock file for a data path
pub fn lock_file_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Which thread holds which key, so same-thread reentry fails fast
#[derive(Debug, Default, Clone)]
struct Holders(Arc<Mutex<HashMap<PathBuf, ThreadId>>>);

impl Holders {
    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, ThreadId>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reentry(&self, key: &Path) -> Result<()> {
        if self.lock().get(key) == Some(&thread::current().id()) {
            return Err(StoreError::LockReentered {
                path: key.to_path_buf(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// OS advisory lock
// ============================================================================

/// Advisory file lock manager backed by fs2
#[derive(Debug, Default, Clone)]
pub struct FileLockManager {
    holders: Holders,
}

impl FileLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

struct FileLock {
    file: File,
    key: PathBuf,
    holders: Holders,
}

impl HeldLock for FileLock {
    fn unlock(self: Box<Self>) {
        // Forget the holder before the OS lock goes, so a waiter never sees a stale entry
        self.holders.lock().remove(&self.key);
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.key.display(), "failed to unlock: {}", e);
        }
    }
}

impl LockManager for FileLockManager {
    fn acquire(&self, path: &Path, timeout: Duration) -> Result<LockGuard> {
        let key = lock_key(path);
        self.holders.check_reentry(&key)?;

        let lock_path = lock_file_path(&key);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|e| StoreError::io(&lock_path, e))?;
        }

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(ref e) if is_contended(e) => {
                    if start.elapsed() >= timeout {
                        return Err(StoreError::LockTimeout { path: key, timeout });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(StoreError::io(&lock_path, e)),
            }
        }

        self.holders
            .lock()
            .insert(key.clone(), thread::current().id());
        tracing::debug!(path = %key.display(), waited_ms = start.elapsed().as_millis() as u64, "lock acquired");

        Ok(LockGuard::new(
            key.clone(),
            Box::new(FileLock {
                file,
                key,
                holders: self.holders.clone(),
            }),
        ))
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

// ============================================================================
// In-memory fake
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    held: Mutex<HashMap<PathBuf, ThreadId>>,
    released: Condvar,
    acquisitions: Mutex<usize>,
}

/// In-process lock manager for tests
#[derive(Debug, Default, Clone)]
pub struct MemoryLockManager {
    state: Arc<MemoryState>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any holder currently has `path` locked
    pub fn is_locked(&self, path: &Path) -> bool {
        let held = self.state.held.lock().unwrap_or_else(|e| e.into_inner());
        held.contains_key(&lock_key(path))
    }

    /// Total successful acquisitions so far
    pub fn acquisitions(&self) -> usize {
        *self
            .state
            .acquisitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

struct MemoryLock {
    key: PathBuf,
    state: Arc<MemoryState>,
}

impl HeldLock for MemoryLock {
    fn unlock(self: Box<Self>) {
        let mut held = self.state.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.key);
        self.state.released.notify_all();
    }
}

impl LockManager for MemoryLockManager {
    fn acquire(&self, path: &Path, timeout: Duration) -> Result<LockGuard> {
        let key = lock_key(path);
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;

        let mut held = self.state.held.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match held.get(&key) {
                Some(owner) if *owner == me => {
                    return Err(StoreError::LockReentered { path: key });
                }
                Some(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StoreError::LockTimeout { path: key, timeout });
                    }
                    held = self
                        .state
                        .released
                        .wait_timeout(held, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
                None => break,
            }
        }
        held.insert(key.clone(), me);
        drop(held);

        *self
            .state
            .acquisitions
            .lock()
            .unwrap_or_else(|e| e.into_inner()) += 1;

        Ok(LockGuard::new(
            key.clone(),
            Box::new(MemoryLock {
                key,
                state: Arc::clone(&self.state),
            }),
        ))
    }
}
