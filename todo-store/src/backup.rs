//! Two-tier backups
//!
//! Tier 1 (operational): a numbered ring at `<dir>/.backups/<file>.<1..N>`,
//! refreshed by the atomic writer before every successful write.
//!
//! Tier 2 (recovery): typed snapshots at
//! `<dir>/backups/<type>/<file>.<type>.<timestamp>`, each with a sibling
//! `.manifest.json`. One backup id (`<type>.<timestamp>`) covers every store
//! file present when it was taken.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic::{self, AtomicWriter};
use crate::clock::Clock;
use crate::error::{Result, StoreError};
use crate::integrity;
use crate::lock::LockGuard;
use crate::validate::SCHEMA_BACKUP;

/// Tier 1 directory name, next to the protected file
pub const OPERATIONAL_DIR: &str = ".backups";
/// Tier 2 directory name under the store directory
pub const RECOVERY_DIR: &str = "backups";

const MANIFEST_SUFFIX: &str = ".manifest.json";
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// Copy `path` into slot 1 of its Tier 1 ring, shifting older copies up and
/// dropping the one past `keep`.
pub fn rotate_operational(path: &Path, keep: usize) -> Result<Option<PathBuf>> {
    if keep == 0 {
        return Ok(None);
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    let dir = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(OPERATIONAL_DIR);
    fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

    let slot = |n: usize| dir.join(format!("{}.{}", name, n));

    let oldest = slot(keep);
    if oldest.exists() {
        fs::remove_file(&oldest).map_err(|e| StoreError::io(&oldest, e))?;
    }
    for n in (1..keep).rev() {
        let from = slot(n);
        if from.exists() {
            fs::rename(&from, slot(n + 1)).map_err(|e| StoreError::io(&from, e))?;
        }
    }

    let newest = slot(1);
    fs::copy(path, &newest).map_err(|e| StoreError::io(&newest, e))?;
    Ok(Some(newest))
}

/// Tier 2 backup type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Taken on request
    Snapshot,
    /// Taken before a destructive operation (compaction, restore)
    Safety,
    /// Taken before archiving
    Archive,
    /// Taken before a schema migration
    Migration,
}

impl BackupKind {
    pub const ALL: [BackupKind; 4] = [
        BackupKind::Snapshot,
        BackupKind::Safety,
        BackupKind::Archive,
        BackupKind::Migration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Snapshot => "snapshot",
            BackupKind::Safety => "safety",
            BackupKind::Archive => "archive",
            BackupKind::Migration => "migration",
        }
    }

    pub fn default_retention(self) -> RetentionPolicy {
        match self {
            BackupKind::Snapshot => RetentionPolicy::Count(10),
            BackupKind::Safety => RetentionPolicy::MaxAgeDays(7),
            BackupKind::Archive => RetentionPolicy::Count(20),
            BackupKind::Migration => RetentionPolicy::Count(5),
        }
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(BackupKind::Snapshot),
            "safety" => Ok(BackupKind::Safety),
            "archive" => Ok(BackupKind::Archive),
            "migration" => Ok(BackupKind::Migration),
            _ => Err(format!("Unknown backup type: {}", s)),
        }
    }
}

/// How many Tier 2 backups of one type survive pruning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetentionPolicy {
    /// Keep the newest N
    Count(usize),
    /// Drop backups older than N days; the newest always survives
    MaxAgeDays(u32),
}

/// Sidecar describing one backed-up file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    /// RFC 3339, millisecond precision
    pub timestamp: String,
    /// `_meta`-style checksum of the tasks array (empty if the file did not parse)
    pub source_checksum: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    /// File name of the original, relative to the store directory
    pub source: String,
    /// Checksum of the raw copied bytes
    pub content_checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub source: String,
    pub path: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: BackupManifest,
}

/// All files captured under one backup id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub files: Vec<BackupFile>,
}

/// Store file a Tier 2 backup covers, with the schema its restore must satisfy
#[derive(Debug, Clone)]
pub struct BackupSource {
    pub path: PathBuf,
    pub schema: &'static str,
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub restored: BackupRecord,
    /// Safety backup of the state that was overwritten, if there was any
    pub safety: Option<BackupRecord>,
}

/// Creates, lists, prunes and restores Tier 2 backups
pub struct BackupManager {
    store_dir: PathBuf,
    sources: Vec<BackupSource>,
    writer: Arc<AtomicWriter>,
    clock: Arc<dyn Clock>,
    retention: HashMap<BackupKind, RetentionPolicy>,
}

impl BackupManager {
    pub fn new(
        store_dir: PathBuf,
        sources: Vec<BackupSource>,
        writer: Arc<AtomicWriter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store_dir,
            sources,
            writer,
            clock,
            retention: BackupKind::ALL
                .iter()
                .map(|k| (*k, k.default_retention()))
                .collect(),
        }
    }

    pub fn with_retention(mut self, kind: BackupKind, policy: RetentionPolicy) -> Self {
        self.retention.insert(kind, policy);
        self
    }

    pub fn retention(&self, kind: BackupKind) -> RetentionPolicy {
        self.retention
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_retention())
    }

    pub fn recovery_dir(&self, kind: BackupKind) -> PathBuf {
        self.store_dir.join(RECOVERY_DIR).join(kind.as_str())
    }

    /// Take a Tier 2 backup of every store file present, then apply retention.
    /// Every source is locked first, in source order, so the copies come from
    /// one point in time.
    pub fn create_backup(&self, kind: BackupKind) -> Result<BackupRecord> {
        self.require_present()?;
        let _guards = self.lock_sources()?;
        self.capture(kind, None)
    }

    /// [`create_backup`](Self::create_backup) for callers already holding the
    /// store locks
    pub fn create_backup_held(&self, kind: BackupKind) -> Result<BackupRecord> {
        self.capture(kind, None)
    }

    fn lock_sources(&self) -> Result<Vec<LockGuard>> {
        self.sources
            .iter()
            .map(|s| self.writer.lock(&s.path))
            .collect()
    }

    fn require_present(&self) -> Result<()> {
        if self.sources.iter().any(|s| s.path.exists()) {
            return Ok(());
        }
        let missing = self
            .sources
            .first()
            .map(|s| s.path.clone())
            .unwrap_or_else(|| self.store_dir.clone());
        Err(StoreError::FileNotFound(missing))
    }

    /// Copy every present source, then prune `kind`, sparing `spare` if given
    fn capture(&self, kind: BackupKind, spare: Option<&str>) -> Result<BackupRecord> {
        self.require_present()?;
        let present: Vec<&BackupSource> = self.sources.iter().filter(|s| s.path.exists()).collect();

        let dir = self.recovery_dir(kind);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        // Ids must be unique even if two backups land in the same millisecond
        let mut created_at = self.clock.now_utc();
        while self.id_taken(kind, created_at)? {
            created_at += chrono::Duration::milliseconds(1);
        }
        let stamp = created_at.format(STAMP_FORMAT).to_string();
        let id = format!("{}.{}", kind, stamp);

        let mut files = Vec::with_capacity(present.len());
        for source in present {
            let name = file_name(&source.path)?;
            let bytes = atomic::read_bytes(&source.path)?;
            let source_checksum = serde_json::from_slice::<serde_json::Value>(&bytes)
                .map(|doc| integrity::verify_document(&doc).actual().to_string())
                .unwrap_or_default();

            let manifest = BackupManifest {
                timestamp: created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                source_checksum,
                kind,
                source: name.clone(),
                content_checksum: integrity::digest_hex(&bytes),
            };
            let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

            let path = dir.join(format!("{}.{}.{}", name, kind, stamp));
            let manifest_path = manifest_path_for(&path);
            if let Err(errors) = self.writer.validator().validate(&manifest_bytes, SCHEMA_BACKUP) {
                return Err(StoreError::SchemaInvalid {
                    path: manifest_path,
                    schema: SCHEMA_BACKUP.to_string(),
                    errors,
                });
            }

            atomic::persist_file(&path, &bytes)?;
            atomic::persist_file(&manifest_path, &manifest_bytes)?;
            files.push(BackupFile {
                source: name,
                path,
                manifest_path,
                manifest,
            });
        }

        tracing::info!(id = %id, files = files.len(), "created backup");
        let record = BackupRecord {
            id,
            kind,
            created_at,
            files,
        };
        self.prune_sparing(kind, spare)?;
        Ok(record)
    }

    fn id_taken(&self, kind: BackupKind, at: DateTime<Utc>) -> Result<bool> {
        let id = format!("{}.{}", kind, at.format(STAMP_FORMAT));
        Ok(self.list_backups(Some(kind))?.iter().any(|r| r.id == id))
    }

    /// Tier 2 backups, newest first
    pub fn list_backups(&self, kind: Option<BackupKind>) -> Result<Vec<BackupRecord>> {
        let root = self.store_dir.join(RECOVERY_DIR);
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut grouped: BTreeMap<String, BackupRecord> = BTreeMap::new();
        for entry in walkdir::WalkDir::new(&root)
            .min_depth(2)
            .max_depth(2) // backups/<type>/<file>
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let manifest_path = entry.path();
            let is_manifest = manifest_path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX));
            if !entry.file_type().is_file() || !is_manifest {
                continue;
            }

            let manifest = match read_manifest(manifest_path) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %manifest_path.display(), "skipping unreadable manifest: {}", e);
                    continue;
                }
            };
            if kind.is_some_and(|k| k != manifest.kind) {
                continue;
            }
            let created_at = match DateTime::parse_from_rfc3339(&manifest.timestamp) {
                Ok(t) => t.with_timezone(&Utc),
                Err(e) => {
                    tracing::warn!(path = %manifest_path.display(), "skipping manifest with bad timestamp: {}", e);
                    continue;
                }
            };

            let id = format!("{}.{}", manifest.kind, created_at.format(STAMP_FORMAT));
            let path = data_path_for(manifest_path);
            let record = grouped.entry(id.clone()).or_insert_with(|| BackupRecord {
                id,
                kind: manifest.kind,
                created_at,
                files: Vec::new(),
            });
            record.files.push(BackupFile {
                source: manifest.source.clone(),
                path,
                manifest_path: manifest_path.to_path_buf(),
                manifest,
            });
        }

        let mut records: Vec<BackupRecord> = grouped.into_values().collect();
        for record in &mut records {
            record.files.sort_by(|a, b| a.source.cmp(&b.source));
        }
        // Sort by creation time, newest first
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(records)
    }

    pub fn find_backup(&self, id: &str) -> Result<BackupRecord> {
        let kind = id
            .split('.')
            .next()
            .and_then(|k| k.parse::<BackupKind>().ok())
            .ok_or_else(|| StoreError::BackupNotFound(id.to_string()))?;
        self.list_backups(Some(kind))?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::BackupNotFound(id.to_string()))
    }

    /// Check every copy against the checksums its manifest recorded
    pub fn verify_backup(&self, record: &BackupRecord) -> Result<()> {
        for file in &record.files {
            self.read_verified(record, file)?;
        }
        Ok(())
    }

    /// Contents of one backed-up file, checked against its manifest
    fn read_verified(&self, record: &BackupRecord, file: &BackupFile) -> Result<Vec<u8>> {
        let corrupt = |reason: String| StoreError::BackupCorrupt {
            id: record.id.clone(),
            reason,
        };
        let bytes = fs::read(&file.path)
            .map_err(|e| corrupt(format!("{}: {}", file.path.display(), e)))?;

        let content = integrity::digest_hex(&bytes);
        if content != file.manifest.content_checksum {
            return Err(corrupt(format!(
                "{}: content checksum {} != recorded {}",
                file.source, content, file.manifest.content_checksum
            )));
        }

        if !file.manifest.source_checksum.is_empty() {
            let doc: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|e| corrupt(format!("{}: {}", file.source, e)))?;
            let status = integrity::verify_document(&doc);
            if status.actual() != file.manifest.source_checksum {
                return Err(corrupt(format!(
                    "{}: tasks checksum {} != recorded {}",
                    file.source,
                    status.actual(),
                    file.manifest.source_checksum
                )));
            }
        }
        Ok(bytes)
    }

    /// Restore every file of backup `id` under the store locks.
    ///
    /// All copies are read, verified and validated before anything is written,
    /// and the safety backup taken of the current state never prunes the
    /// backup being restored.
    pub fn restore_backup(&self, id: &str) -> Result<RestoreOutcome> {
        let record = self.find_backup(id)?;
        let guards = self.lock_sources()?;

        let mut staged = Vec::with_capacity(record.files.len());
        for file in &record.files {
            let source = self
                .sources
                .iter()
                .find(|s| s.path.file_name().and_then(|n| n.to_str()) == Some(file.source.as_str()))
                .ok_or_else(|| {
                    StoreError::InvalidOperation(format!(
                        "backup {} contains unknown file {}",
                        record.id, file.source
                    ))
                })?;
            let bytes = self.read_verified(&record, file)?;
            if let Err(errors) = self.writer.validator().validate(&bytes, source.schema) {
                return Err(StoreError::BackupCorrupt {
                    id: record.id.clone(),
                    reason: format!("{}: {}", file.source, errors.join("; ")),
                });
            }
            let guard = guards
                .iter()
                .find(|g| g.covers(&source.path))
                .ok_or_else(|| {
                    StoreError::InvalidOperation(format!("{} is not locked", source.path.display()))
                })?;
            staged.push((source, guard, bytes));
        }

        let safety = if self.sources.iter().any(|s| s.path.exists()) {
            Some(self.capture(BackupKind::Safety, Some(record.id.as_str()))?)
        } else {
            None
        };

        for (source, guard, bytes) in staged {
            self.writer
                .write_locked(guard, &source.path, &bytes, source.schema)?;
        }
        drop(guards);

        tracing::info!(
            id = %record.id,
            safety = safety.as_ref().map(|s| s.id.as_str()).unwrap_or("none"),
            "restored backup"
        );
        Ok(RestoreOutcome {
            restored: record,
            safety,
        })
    }

    /// Apply the retention policy of `kind`; returns how many backups were removed
    pub fn prune(&self, kind: BackupKind) -> Result<usize> {
        self.prune_sparing(kind, None)
    }

    fn prune_sparing(&self, kind: BackupKind, spare: Option<&str>) -> Result<usize> {
        let records: Vec<BackupRecord> = self
            .list_backups(Some(kind))?
            .into_iter()
            .filter(|r| Some(r.id.as_str()) != spare)
            .collect();
        let doomed: Vec<&BackupRecord> = match self.retention(kind) {
            RetentionPolicy::Count(keep) => records.iter().skip(keep).collect(),
            RetentionPolicy::MaxAgeDays(days) => {
                let cutoff = self.clock.now_utc() - chrono::Duration::days(i64::from(days));
                records
                    .iter()
                    .skip(1)
                    .filter(|r| r.created_at < cutoff)
                    .collect()
            }
        };

        for record in &doomed {
            for file in &record.files {
                for path in [&file.path, &file.manifest_path] {
                    if let Err(e) = fs::remove_file(path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return Err(StoreError::io(path, e));
                        }
                    }
                }
            }
            tracing::debug!(id = %record.id, "pruned backup");
        }
        Ok(doomed.len())
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidOperation(format!("{} has no file name", path.display())))
}

fn manifest_path_for(data: &Path) -> PathBuf {
    let mut name = data.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(MANIFEST_SUFFIX);
    data.with_file_name(name)
}

fn data_path_for(manifest: &Path) -> PathBuf {
    let name = manifest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    manifest.with_file_name(name.trim_end_matches(MANIFEST_SUFFIX))
}

fn read_manifest(path: &Path) -> Result<BackupManifest> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lock::MemoryLockManager;
    use crate::validate::NoopValidator;
    use tempfile::TempDir;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-06T13:12:33Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn setup() -> (TempDir, BackupManager, ManualClock) {
        let temp_dir = TempDir::new().unwrap();
        let writer = Arc::new(AtomicWriter::new(
            Arc::new(MemoryLockManager::new()),
            Arc::new(NoopValidator),
        ));
        let clock = ManualClock::new(start());
        let sources = vec![
            BackupSource {
                path: temp_dir.path().join("todo.json"),
                schema: "todo",
            },
            BackupSource {
                path: temp_dir.path().join("todo-archive.json"),
                schema: "archive",
            },
        ];
        let manager = BackupManager::new(
            temp_dir.path().to_path_buf(),
            sources,
            writer,
            Arc::new(clock.clone()),
        );
        (temp_dir, manager, clock)
    }

    #[test]
    fn test_rotate_operational_keeps_ring() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("todo.json");

        for v in 1..=4 {
            fs::write(&path, format!("v{}", v)).unwrap();
            rotate_operational(&path, 3).unwrap();
        }

        let ring = temp_dir.path().join(OPERATIONAL_DIR);
        assert_eq!(fs::read_to_string(ring.join("todo.json.1")).unwrap(), "v4");
        assert_eq!(fs::read_to_string(ring.join("todo.json.2")).unwrap(), "v3");
        assert_eq!(fs::read_to_string(ring.join("todo.json.3")).unwrap(), "v2");
        assert!(!ring.join("todo.json.4").exists());
    }

    #[test]
    fn test_create_backup_covers_present_files() {
        let (temp_dir, manager, _clock) = setup();
        fs::write(temp_dir.path().join("todo.json"), r#"{"tasks":[]}"#).unwrap();

        let record = manager.create_backup(BackupKind::Snapshot).unwrap();
        assert_eq!(record.id, "snapshot.20260206T131233000Z");
        assert_eq!(record.files.len(), 1);

        let file = &record.files[0];
        assert_eq!(
            file.path,
            temp_dir
                .path()
                .join("backups/snapshot/todo.json.snapshot.20260206T131233000Z")
        );
        assert!(file.manifest_path.exists());
        assert_eq!(file.manifest.source_checksum, "4f53cda18c2baa0c");
        assert_eq!(file.manifest.timestamp, "2026-02-06T13:12:33.000Z");
    }

    #[test]
    fn test_create_backup_without_store_is_not_found() {
        let (_temp_dir, manager, _clock) = setup();
        let err = manager.create_backup(BackupKind::Snapshot).unwrap_err();
        assert!(matches!(err, StoreError::FileNotFound(_)));
    }

    #[test]
    fn test_same_millisecond_backups_get_distinct_ids() {
        let (temp_dir, manager, _clock) = setup();
        fs::write(temp_dir.path().join("todo.json"), r#"{"tasks":[]}"#).unwrap();

        let a = manager.create_backup(BackupKind::Snapshot).unwrap();
        let b = manager.create_backup(BackupKind::Snapshot).unwrap();
        assert_ne!(a.id, b.id);

        let listed = manager.list_backups(None).unwrap();
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].id, a.id);
    }

    #[test]
    fn test_count_retention_prunes_oldest() {
        let (temp_dir, manager, clock) = setup();
        let manager = manager.with_retention(BackupKind::Snapshot, RetentionPolicy::Count(2));
        fs::write(temp_dir.path().join("todo.json"), r#"{"tasks":[]}"#).unwrap();

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(manager.create_backup(BackupKind::Snapshot).unwrap().id);
            clock.advance(chrono::Duration::minutes(1));
        }

        let kept: Vec<String> = manager
            .list_backups(Some(BackupKind::Snapshot))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(kept, vec![ids[3].clone(), ids[2].clone()]);
    }

    #[test]
    fn test_age_retention_always_keeps_newest() {
        let (temp_dir, manager, clock) = setup();
        fs::write(temp_dir.path().join("todo.json"), r#"{"tasks":[]}"#).unwrap();

        manager.create_backup(BackupKind::Safety).unwrap();
        clock.advance(chrono::Duration::days(1));
        let newest = manager.create_backup(BackupKind::Safety).unwrap();

        clock.advance(chrono::Duration::days(30));
        let removed = manager.prune(BackupKind::Safety).unwrap();
        assert_eq!(removed, 1);

        let left = manager.list_backups(Some(BackupKind::Safety)).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, newest.id);
    }

    #[test]
    fn test_restore_takes_safety_backup_and_restores_bytes() {
        let (temp_dir, manager, clock) = setup();
        let todo = temp_dir.path().join("todo.json");
        fs::write(&todo, r#"{"tasks":[{"id":"T001"}]}"#).unwrap();

        let snapshot = manager.create_backup(BackupKind::Snapshot).unwrap();
        clock.advance(chrono::Duration::seconds(5));
        fs::write(&todo, r#"{"tasks":[]}"#).unwrap();

        let outcome = manager.restore_backup(&snapshot.id).unwrap();
        assert_eq!(
            fs::read_to_string(&todo).unwrap(),
            r#"{"tasks":[{"id":"T001"}]}"#
        );
        let safety = outcome.safety.unwrap();
        assert_eq!(safety.kind, BackupKind::Safety);
        assert_eq!(
            fs::read_to_string(&safety.files[0].path).unwrap(),
            r#"{"tasks":[]}"#
        );
    }

    #[test]
    fn test_restore_spares_restored_backup_under_count_retention() {
        let (temp_dir, manager, clock) = setup();
        let manager = manager.with_retention(BackupKind::Safety, RetentionPolicy::Count(1));
        let todo = temp_dir.path().join("todo.json");
        fs::write(&todo, r#"{"tasks":[{"id":"T001"}]}"#).unwrap();

        let old = manager.create_backup(BackupKind::Safety).unwrap();
        clock.advance(chrono::Duration::minutes(1));
        fs::write(&todo, r#"{"tasks":[]}"#).unwrap();

        let outcome = manager.restore_backup(&old.id).unwrap();
        assert_eq!(
            fs::read_to_string(&todo).unwrap(),
            r#"{"tasks":[{"id":"T001"}]}"#
        );
        assert!(outcome.safety.is_some());
        assert!(manager.find_backup(&old.id).is_ok());
    }

    #[test]
    fn test_restore_refuses_tampered_backup() {
        let (temp_dir, manager, _clock) = setup();
        let todo = temp_dir.path().join("todo.json");
        fs::write(&todo, r#"{"tasks":[]}"#).unwrap();

        let record = manager.create_backup(BackupKind::Snapshot).unwrap();
        fs::write(&record.files[0].path, r#"{"tasks":[{"id":"T009"}]}"#).unwrap();
        fs::write(&todo, "current").unwrap();

        let err = manager.restore_backup(&record.id).unwrap_err();
        assert!(matches!(err, StoreError::BackupCorrupt { .. }));
        assert_eq!(fs::read_to_string(&todo).unwrap(), "current");
        assert!(manager
            .list_backups(Some(BackupKind::Safety))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_restore_unknown_id() {
        let (_temp_dir, manager, _clock) = setup();
        let err = manager.restore_backup("snapshot.20990101T000000000Z").unwrap_err();
        assert!(matches!(err, StoreError::BackupNotFound(_)));
        let err = manager.restore_backup("garbage").unwrap_err();
        assert!(matches!(err, StoreError::BackupNotFound(_)));
    }
}
