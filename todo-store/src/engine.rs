//! Store engine: the task operations, wired through migration, locking,
//! integrity checks, the dependency graph and the atomic writer
//!
//! Every mutation runs the same pipeline:
//! ensure schema version -> lock todo.json -> read fresh content -> refuse on
//! checksum mismatch -> apply the change (cycle checks included) against a graph
//! built from that content -> recompute checksum -> `write_locked` -> release ->
//! append to the audit log.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::atomic::{self, AtomicWriter};
use crate::audit::{AuditEntry, AuditLog};
use crate::backup::{BackupKind, BackupManager, BackupRecord, BackupSource, RestoreOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::graph::analysis::{self, BlockerRank, ChainDepth, CriticalPath};
use crate::graph::{self, DependencyGraph, GraphCache};
use crate::integrity::{self, IntegrityStatus};
use crate::lock::{FileLockManager, LockManager};
use crate::migrate::{FileType, MigrationRegistry, MigrationReport, Migrator};
use crate::model::{ArchiveStore, Focus, Priority, Task, TaskId, TaskStatus, TaskStore};
use crate::validate::{SchemaValidator, StoreSchemaValidator, SCHEMA_ARCHIVE, SCHEMA_TODO};

/// Fields for a new task
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub parent_id: Option<TaskId>,
    pub depends: BTreeSet<TaskId>,
    pub labels: BTreeSet<String>,
    pub phase: Option<String>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Partial update; `None` leaves a field alone
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    /// Replaces the whole dependency set
    pub depends: Option<BTreeSet<TaskId>>,
    pub labels: Option<BTreeSet<String>>,
    pub phase: Option<String>,
    pub blocked_by: Option<String>,
}

/// A store read without locking
#[derive(Debug, Clone)]
pub struct LoadedStore {
    pub store: TaskStore,
    /// Mismatch means the file was edited by hand; writes stay blocked until reconcile
    pub integrity: IntegrityStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveReport {
    pub archived: Vec<TaskId>,
    pub safety_backup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledFile {
    pub file: String,
    pub previous: Option<String>,
    pub checksum: String,
    pub changed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

struct MutationContext {
    now: DateTime<Utc>,
    archived: HashSet<TaskId>,
}

impl MutationContext {
    fn known(&self, store: &TaskStore, id: &TaskId) -> bool {
        store.contains(id) || self.archived.contains(id)
    }
}

/// Handle on one store directory
pub struct StoreEngine {
    config: StoreConfig,
    writer: Arc<AtomicWriter>,
    backups: Arc<BackupManager>,
    migrator: Migrator,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    cache: GraphCache,
}

impl StoreEngine {
    /// Engine with the OS advisory lock, the built-in validator and the system clock
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::with_parts(
            config,
            Arc::new(FileLockManager::new()),
            Arc::new(StoreSchemaValidator),
            Arc::new(SystemClock),
        )
    }

    pub fn with_parts(
        config: StoreConfig,
        locks: Arc<dyn LockManager>,
        validator: Arc<dyn SchemaValidator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let writer = Arc::new(
            AtomicWriter::new(locks.clone(), validator)
                .with_lock_timeout(config.lock_timeout)
                .with_max_operational_backups(config.max_operational_backups),
        );

        let sources = vec![
            BackupSource {
                path: config.todo_file(),
                schema: SCHEMA_TODO,
            },
            BackupSource {
                path: config.archive_file(),
                schema: SCHEMA_ARCHIVE,
            },
        ];
        let backups = BackupKind::ALL.iter().fold(
            BackupManager::new(
                config.store_dir.clone(),
                sources,
                writer.clone(),
                clock.clone(),
            ),
            |manager, kind| manager.with_retention(*kind, config.retention_for(*kind)),
        );
        let backups = Arc::new(backups);

        let migrator = Migrator::new(MigrationRegistry::builtin()?, writer.clone(), backups.clone());
        let audit = AuditLog::new(config.log_file(), locks, config.lock_timeout);

        if config.store_dir.exists() {
            if let Err(e) = atomic::cleanup_stale_temps(&config.store_dir) {
                tracing::warn!(dir = %config.store_dir.display(), "stale temp cleanup failed: {}", e);
            }
        }

        Ok(Self {
            config,
            writer,
            backups,
            migrator,
            audit,
            clock,
            cache: GraphCache::new(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    // ========================================================================
    // Lifecycle and reads
    // ========================================================================

    /// Create an empty store. The recorded checksum is read back from disk.
    pub fn init(&mut self, project: &str) -> Result<TaskStore> {
        let todo = self.config.todo_file();
        let refuse_existing = || {
            StoreError::InvalidOperation(format!("{} already exists", todo.display()))
        };
        if todo.exists() {
            return Err(refuse_existing());
        }
        self.config
            .ensure_dirs()
            .map_err(|e| StoreError::io(&self.config.store_dir, e))?;

        // Another process may have initialized while we waited for the lock
        let archive = self.config.archive_file();
        let mut todo_guard = self.writer.lock(&todo)?;
        let mut archive_guard = self.writer.lock(&archive)?;
        if todo.exists() {
            return Err(refuse_existing());
        }

        let mut store = TaskStore::new(
            project.to_string(),
            &FileType::Todo.current_version().to_string(),
        );
        store.meta.checksum = integrity::checksum_tasks(&store.tasks)?;
        if !archive.exists() {
            let mut empty = ArchiveStore::new(&FileType::Archive.current_version().to_string());
            empty.meta.checksum = integrity::checksum_tasks(&empty.tasks)?;
            self.writer.write_locked(
                &archive_guard,
                &archive,
                &serde_json::to_vec_pretty(&empty)?,
                SCHEMA_ARCHIVE,
            )?;
        }
        self.writer.write_locked(
            &todo_guard,
            &todo,
            &serde_json::to_vec_pretty(&store)?,
            SCHEMA_TODO,
        )?;
        archive_guard.release();
        todo_guard.release();

        // Trust what landed on disk, not what we meant to write
        let written = read_value(&todo)?;
        store.meta.checksum = match integrity::verify_document(&written) {
            IntegrityStatus::Valid { checksum } => checksum,
            other => {
                return Err(StoreError::ChecksumMismatch {
                    path: todo,
                    recorded: store.meta.checksum,
                    actual: other.actual().to_string(),
                })
            }
        };

        tracing::info!(dir = %self.config.store_dir.display(), project, "initialized store");
        self.record(AuditEntry::new("init", self.clock.now_utc()).after(&store.project));
        Ok(store)
    }

    /// Read the store without locking. A checksum mismatch is reported, not fatal.
    pub fn load(&mut self) -> Result<LoadedStore> {
        self.ensure_compatible_version()?;
        let path = self.config.todo_file();
        let doc = read_value(&path)?;
        let integrity = integrity::verify_document(&doc);
        if let IntegrityStatus::Mismatch { recorded, actual } = &integrity {
            tracing::warn!(
                path = %path.display(),
                recorded = %recorded,
                actual = %actual,
                "checksum mismatch: file was edited outside the engine; run reconcile before writing"
            );
        }
        let store = parse_store(&path, doc)?;
        Ok(LoadedStore { store, integrity })
    }

    /// Archived tasks; empty if there is no archive yet
    pub fn load_archive(&self) -> Result<ArchiveStore> {
        let path = self.config.archive_file();
        if !path.exists() {
            return Ok(ArchiveStore::new(
                &FileType::Archive.current_version().to_string(),
            ));
        }
        let doc = read_value(&path)?;
        serde_json::from_value(doc).map_err(|source| StoreError::Parse { path, source })
    }

    /// Migrate todo.json (and the archive, if present) to the current schema
    pub fn ensure_compatible_version(&mut self) -> Result<Vec<MigrationReport>> {
        let todo = self.config.todo_file();
        if !todo.exists() {
            return Err(StoreError::FileNotFound(todo));
        }
        let mut reports = vec![self
            .migrator
            .ensure_compatible_version(&todo, FileType::Todo)?];

        let archive = self.config.archive_file();
        if archive.exists() {
            reports.push(
                self.migrator
                    .ensure_compatible_version(&archive, FileType::Archive)?,
            );
        }

        for report in reports.iter().filter(|r| !r.is_noop()) {
            tracing::info!(
                file = %report.path.display(),
                from = %report.from,
                to = %report.to,
                "migrated store file"
            );
            self.record(
                AuditEntry::new("migrate", self.clock.now_utc())
                    .before(report.from.to_string())
                    .after(report.to.to_string()),
            );
        }
        Ok(reports)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    fn mutate<T>(
        &mut self,
        change: impl FnOnce(&mut TaskStore, &DependencyGraph, &MutationContext) -> Result<(T, AuditEntry)>,
    ) -> Result<T> {
        self.ensure_compatible_version()?;

        let path = self.config.todo_file();
        let mut guard = self.writer.lock(&path)?;

        let doc = read_value(&path)?;
        refuse_mismatch(&path, &doc)?;
        let mut store = parse_store(&path, doc)?;

        let ctx = MutationContext {
            now: self.clock.now_utc(),
            archived: self.load_archive()?.ids(),
        };
        let graph = self.cache.ensure(&store)?;
        let (value, entry) = change(&mut store, graph, &ctx)?;

        store.meta.checksum = integrity::checksum_tasks(&store.tasks)?;
        let bytes = serde_json::to_vec_pretty(&store)?;
        self.writer
            .write_locked(&guard, &path, &bytes, SCHEMA_TODO)?;
        guard.release();

        self.record(entry);
        Ok(value)
    }

    pub fn add_task(&mut self, new: NewTask) -> Result<Task> {
        self.mutate(|store, _graph, ctx| {
            if new.title.trim().is_empty() {
                return Err(StoreError::InvalidOperation(
                    "task title must not be empty".to_string(),
                ));
            }
            if let Some(parent) = &new.parent_id {
                if !store.contains(parent) {
                    return Err(StoreError::TaskNotFound(parent.clone()));
                }
            }
            if let Some(missing) = new.depends.iter().find(|d| !ctx.known(store, d)) {
                return Err(StoreError::TaskNotFound(missing.clone()));
            }

            let id = store.allocate_id(&ctx.archived)?;
            let mut task = Task::new(id, new.title, ctx.now);
            task.description = new.description;
            task.priority = new.priority;
            task.parent_id = new.parent_id;
            task.depends = new.depends;
            task.labels = new.labels;
            task.phase = new.phase;
            store.tasks.push(task.clone());

            let entry = AuditEntry::new("add", ctx.now).task(&task.id).after(&task);
            Ok((task, entry))
        })
    }

    pub fn update_task(&mut self, id: &TaskId, update: TaskUpdate) -> Result<Task> {
        self.mutate(|store, graph, ctx| {
            if let Some(depends) = &update.depends {
                if let Some(missing) = depends.iter().find(|d| !ctx.known(store, d)) {
                    return Err(StoreError::TaskNotFound(missing.clone()));
                }
                for dep in depends {
                    if let Some(cycle) = graph::would_create_cycle(graph, id, dep) {
                        return Err(StoreError::CircularDependency { cycle });
                    }
                }
            }

            let task = store
                .get_mut(id)
                .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
            let before = task.clone();

            if let Some(title) = update.title {
                if title.trim().is_empty() {
                    return Err(StoreError::InvalidOperation(
                        "task title must not be empty".to_string(),
                    ));
                }
                task.title = title;
            }
            if let Some(description) = update.description {
                task.description = Some(description).filter(|d| !d.is_empty());
            }
            if let Some(priority) = update.priority {
                task.priority = priority;
            }
            if let Some(depends) = update.depends {
                task.depends = depends;
            }
            if let Some(labels) = update.labels {
                task.labels = labels;
            }
            if let Some(phase) = update.phase {
                task.phase = Some(phase).filter(|p| !p.is_empty());
            }
            let status = update.status.unwrap_or(task.status);
            apply_status(task, status, update.blocked_by, ctx.now)?;

            let task = task.clone();
            if task.status.is_terminal() && store.focus.current_task.as_ref() == Some(id) {
                store.focus = Focus::default();
            }
            let entry = AuditEntry::new("update", ctx.now)
                .task(id)
                .before(&before)
                .after(&task);
            Ok((task, entry))
        })
    }

    /// Make `task` depend on `dep`. Rejected if it would close a cycle.
    pub fn add_dependency(&mut self, task: &TaskId, dep: &TaskId) -> Result<Task> {
        self.mutate(|store, graph, ctx| {
            if !store.contains(task) {
                return Err(StoreError::TaskNotFound(task.clone()));
            }
            if let Some(cycle) = graph::would_create_cycle(graph, task, dep) {
                return Err(StoreError::CircularDependency { cycle });
            }
            if !ctx.known(store, dep) {
                return Err(StoreError::TaskNotFound(dep.clone()));
            }

            let entry = store
                .get_mut(task)
                .ok_or_else(|| StoreError::TaskNotFound(task.clone()))?;
            let before = entry.depends.clone();
            entry.depends.insert(dep.clone());

            let updated = entry.clone();
            let audit = AuditEntry::new("add_dependency", ctx.now)
                .task(task)
                .before(&before)
                .after(&updated.depends);
            Ok((updated, audit))
        })
    }

    pub fn remove_dependency(&mut self, task: &TaskId, dep: &TaskId) -> Result<Task> {
        self.mutate(|store, _graph, ctx| {
            let entry = store
                .get_mut(task)
                .ok_or_else(|| StoreError::TaskNotFound(task.clone()))?;
            let before = entry.depends.clone();
            if !entry.depends.remove(dep) {
                return Err(StoreError::InvalidOperation(format!(
                    "{} does not depend on {}",
                    task, dep
                )));
            }

            let updated = entry.clone();
            let audit = AuditEntry::new("remove_dependency", ctx.now)
                .task(task)
                .before(&before)
                .after(&updated.depends);
            Ok((updated, audit))
        })
    }

    pub fn complete_task(&mut self, id: &TaskId) -> Result<Task> {
        self.mutate(|store, _graph, ctx| {
            let task = store
                .get_mut(id)
                .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
            if task.status.is_terminal() {
                return Err(StoreError::InvalidOperation(format!(
                    "{} is already {}",
                    id, task.status
                )));
            }
            let before = task.status;
            apply_status(task, TaskStatus::Done, None, ctx.now)?;
            let task = task.clone();

            if store.focus.current_task.as_ref() == Some(id) {
                store.focus = Focus::default();
            }

            let entry = AuditEntry::new("complete", ctx.now)
                .task(id)
                .before(before)
                .after(task.status);
            Ok((task, entry))
        })
    }

    /// Move `id` under `parent`, or to the top level with `None`
    pub fn reparent(&mut self, id: &TaskId, parent: Option<&TaskId>) -> Result<Task> {
        self.mutate(|store, _graph, ctx| {
            if !store.contains(id) {
                return Err(StoreError::TaskNotFound(id.clone()));
            }
            if let Some(parent) = parent {
                if !store.contains(parent) {
                    return Err(StoreError::TaskNotFound(parent.clone()));
                }
                // Walk up from the new parent; meeting `id` means a loop
                let mut seen = HashSet::new();
                let mut at = Some(parent.clone());
                while let Some(current) = at {
                    if &current == id {
                        return Err(StoreError::InvalidOperation(format!(
                            "{} cannot be moved under its own descendant {}",
                            id, parent
                        )));
                    }
                    if !seen.insert(current.clone()) {
                        break;
                    }
                    at = store.get(&current).and_then(|t| t.parent_id.clone());
                }
            }

            let task = store
                .get_mut(id)
                .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
            let before = task.parent_id.clone();
            task.parent_id = parent.cloned();
            let task = task.clone();

            let entry = AuditEntry::new("reparent", ctx.now)
                .task(id)
                .before(&before)
                .after(&task.parent_id);
            Ok((task, entry))
        })
    }

    /// Point the focus at `id` (a pending task becomes active), or clear it
    pub fn set_focus(&mut self, id: Option<&TaskId>, note: Option<String>) -> Result<Focus> {
        self.mutate(|store, _graph, ctx| {
            let before = store.focus.clone();
            if let Some(id) = id {
                let task = store
                    .get_mut(id)
                    .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
                if task.status.is_terminal() {
                    return Err(StoreError::InvalidOperation(format!(
                        "cannot focus {} task {}",
                        task.status, id
                    )));
                }
                if task.status == TaskStatus::Pending {
                    task.status = TaskStatus::Active;
                }
            }
            store.focus = Focus {
                current_task: id.cloned(),
                note,
            };

            let mut entry = AuditEntry::new("focus", ctx.now)
                .before(&before)
                .after(&store.focus);
            if let Some(id) = id {
                entry = entry.task(id);
            }
            Ok((store.focus.clone(), entry))
        })
    }

    /// Move finished tasks older than `retention_days` (config default if `None`)
    /// into the archive, after a safety backup. A cancelled task that unfinished
    /// work still depends on stays, since archiving would unblock its dependents.
    pub fn archive_completed(&mut self, retention_days: Option<u32>) -> Result<ArchiveReport> {
        self.ensure_compatible_version()?;
        let days = retention_days.unwrap_or(self.config.archive_retention_days);
        let now = self.clock.now_utc();
        let cutoff = now - Duration::days(i64::from(days));

        let todo_path = self.config.todo_file();
        let archive_path = self.config.archive_file();
        let mut todo_guard = self.writer.lock(&todo_path)?;
        let mut archive_guard = self.writer.lock(&archive_path)?;

        let doc = read_value(&todo_path)?;
        refuse_mismatch(&todo_path, &doc)?;
        let mut store = parse_store(&todo_path, doc)?;
        let mut archive = if archive_path.exists() {
            let doc = read_value(&archive_path)?;
            refuse_mismatch(&archive_path, &doc)?;
            serde_json::from_value::<ArchiveStore>(doc).map_err(|source| StoreError::Parse {
                path: archive_path.clone(),
                source,
            })?
        } else {
            ArchiveStore::new(&FileType::Archive.current_version().to_string())
        };

        let graph = self.cache.ensure(&store)?;
        let waited_on = |id: &TaskId| {
            graph.reverse_deps(id).iter().any(|d| {
                store
                    .get(d)
                    .is_some_and(|t| !t.status.is_terminal())
            })
        };
        let eligible: Vec<TaskId> = store
            .tasks
            .iter()
            .filter(|t| t.status.is_terminal())
            .filter(|t| t.completed_at.unwrap_or(t.created_at) <= cutoff)
            .filter(|t| t.status == TaskStatus::Done || !waited_on(&t.id))
            .map(|t| t.id.clone())
            .collect();

        if eligible.is_empty() {
            return Ok(ArchiveReport::default());
        }

        let safety = self.backups.create_backup_held(BackupKind::Safety)?;

        let already: HashSet<TaskId> = archive.ids();
        let (moved, kept): (Vec<Task>, Vec<Task>) = std::mem::take(&mut store.tasks)
            .into_iter()
            .partition(|t| eligible.contains(&t.id));
        store.tasks = kept;
        archive
            .tasks
            .extend(moved.into_iter().filter(|t| !already.contains(&t.id)));
        if store
            .focus
            .current_task
            .as_ref()
            .is_some_and(|f| eligible.contains(f))
        {
            store.focus = Focus::default();
        }

        // Archive first: a crash in between leaves duplicates, never lost tasks
        archive.meta.checksum = integrity::checksum_tasks(&archive.tasks)?;
        self.writer.write_locked(
            &archive_guard,
            &archive_path,
            &serde_json::to_vec_pretty(&archive)?,
            SCHEMA_ARCHIVE,
        )?;
        store.meta.checksum = integrity::checksum_tasks(&store.tasks)?;
        self.writer.write_locked(
            &todo_guard,
            &todo_path,
            &serde_json::to_vec_pretty(&store)?,
            SCHEMA_TODO,
        )?;
        archive_guard.release();
        todo_guard.release();

        tracing::info!(count = eligible.len(), backup = %safety.id, "archived finished tasks");
        self.record(AuditEntry::new("archive", now).after(&eligible));
        Ok(ArchiveReport {
            archived: eligible,
            safety_backup: Some(safety.id),
        })
    }

    /// Accept hand edits: recompute each file's checksum from its actual content
    pub fn reconcile(&mut self) -> Result<Vec<ReconciledFile>> {
        let files = [
            (self.config.todo_file(), SCHEMA_TODO),
            (self.config.archive_file(), SCHEMA_ARCHIVE),
        ];
        let mut results = Vec::new();

        for (path, schema) in files {
            if !path.exists() {
                continue;
            }
            let mut guard = self.writer.lock(&path)?;
            let mut doc = read_value(&path)?;
            let status = integrity::verify_document(&doc);
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let (previous, changed) = match &status {
                IntegrityStatus::Valid { checksum } => (Some(checksum.clone()), false),
                IntegrityStatus::Missing { .. } => (None, true),
                IntegrityStatus::Mismatch { recorded, .. } => (Some(recorded.clone()), true),
            };
            if changed {
                let meta = doc
                    .as_object_mut()
                    .ok_or_else(|| StoreError::SchemaInvalid {
                        path: path.clone(),
                        schema: schema.to_string(),
                        errors: vec!["document must be a JSON object".to_string()],
                    })?
                    .entry("_meta")
                    .or_insert_with(|| Value::Object(Default::default()));
                if let Some(meta) = meta.as_object_mut() {
                    meta.insert("checksum".to_string(), Value::from(status.actual()));
                }
                self.writer
                    .write_locked(&guard, &path, &serde_json::to_vec_pretty(&doc)?, schema)?;
                tracing::info!(file = %file, checksum = %status.actual(), "reconciled checksum");
            }
            guard.release();

            results.push(ReconciledFile {
                file,
                previous,
                checksum: status.actual().to_string(),
                changed,
            });
        }

        if results.iter().any(|r| r.changed) {
            self.record(AuditEntry::new("reconcile", self.clock.now_utc()).after(
                results
                    .iter()
                    .map(|r| format!("{}: {}", r.file, r.checksum))
                    .collect::<Vec<_>>(),
            ));
        }
        Ok(results)
    }

    /// Full health check of both store files
    pub fn validate(&mut self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let todo = self.config.todo_file();
        let bytes = atomic::read_bytes(&todo)?;

        if let Err(errors) = self.writer.validator().validate(&bytes, SCHEMA_TODO) {
            report.errors.extend(errors.into_iter().map(|e| format!("todo.json: {}", e)));
        }
        let archive = self.config.archive_file();
        if archive.exists() {
            let bytes = atomic::read_bytes(&archive)?;
            if let Err(errors) = self.writer.validator().validate(&bytes, SCHEMA_ARCHIVE) {
                report
                    .errors
                    .extend(errors.into_iter().map(|e| format!("todo-archive.json: {}", e)));
            }
        }

        let Ok(doc) = serde_json::from_slice::<Value>(&bytes) else {
            return Ok(report);
        };
        let Ok(store) = serde_json::from_value::<TaskStore>(doc) else {
            return Ok(report);
        };
        let archived = self.load_archive().map(|a| a.ids()).unwrap_or_default();

        for id in store.tasks.iter().map(|t| &t.id).filter(|id| archived.contains(id)) {
            report
                .errors
                .push(format!("{} exists in both todo.json and the archive", id));
        }
        for task in &store.tasks {
            for dep in &task.depends {
                if !store.contains(dep) && !archived.contains(dep) {
                    report
                        .warnings
                        .push(format!("{} depends on unknown task {}", task.id, dep));
                }
            }
            if let Some(parent) = &task.parent_id {
                if !store.contains(parent) && !archived.contains(parent) {
                    report
                        .warnings
                        .push(format!("{} has unknown parent {}", task.id, parent));
                }
            }
        }
        if let Some(focus) = &store.focus.current_task {
            if !store.contains(focus) {
                report
                    .warnings
                    .push(format!("focus points at missing task {}", focus));
            }
        }
        Ok(report)
    }

    // ========================================================================
    // Backups
    // ========================================================================

    pub fn create_backup(&self, kind: BackupKind) -> Result<BackupRecord> {
        self.backups.create_backup(kind)
    }

    pub fn list_backups(&self, kind: Option<BackupKind>) -> Result<Vec<BackupRecord>> {
        self.backups.list_backups(kind)
    }

    pub fn restore_backup(&mut self, id: &str) -> Result<RestoreOutcome> {
        let outcome = self.backups.restore_backup(id)?;
        self.cache.invalidate();
        self.record(
            AuditEntry::new("restore", self.clock.now_utc())
                .before(outcome.safety.as_ref().map(|s| s.id.clone()))
                .after(&outcome.restored.id),
        );
        Ok(outcome)
    }

    // ========================================================================
    // Graph queries
    // ========================================================================

    /// Current dependency graph, rebuilt only if the store changed
    pub fn graph(&mut self) -> Result<&DependencyGraph> {
        let loaded = self.load()?;
        self.cache.ensure(&loaded.store)
    }

    fn with_graph<T>(&mut self, query: impl FnOnce(&DependencyGraph, &[Task]) -> Result<T>) -> Result<T> {
        let loaded = self.load()?;
        let graph = self.cache.ensure(&loaded.store)?;
        query(graph, &loaded.store.tasks)
    }

    pub fn forward_deps(&mut self, id: &TaskId) -> Result<Vec<TaskId>> {
        self.with_graph(|graph, _| {
            require(graph, id)?;
            Ok(graph.forward_deps(id).iter().cloned().collect())
        })
    }

    pub fn reverse_deps(&mut self, id: &TaskId) -> Result<Vec<TaskId>> {
        self.with_graph(|graph, _| {
            require(graph, id)?;
            Ok(graph.reverse_deps(id).iter().cloned().collect())
        })
    }

    /// Preview: the cycle `task -> dep` would close, if any
    pub fn would_create_cycle(&mut self, task: &TaskId, dep: &TaskId) -> Result<Option<Vec<TaskId>>> {
        self.with_graph(|graph, _| Ok(graph::would_create_cycle(graph, task, dep)))
    }

    pub fn blocked_tasks(&mut self) -> Result<Vec<TaskId>> {
        self.with_graph(|graph, tasks| Ok(analysis::compute_blocked_tasks(graph, tasks)))
    }

    pub fn ready_tasks(&mut self) -> Result<Vec<TaskId>> {
        self.with_graph(|graph, tasks| Ok(analysis::ready_tasks(graph, tasks)))
    }

    pub fn chain_depth(&mut self, id: &TaskId, max_depth: usize) -> Result<ChainDepth> {
        self.with_graph(|graph, _| {
            require(graph, id)?;
            Ok(analysis::chain_depth(graph, id, max_depth))
        })
    }

    pub fn impact_count(&mut self, id: &TaskId) -> Result<usize> {
        self.with_graph(|graph, _| {
            require(graph, id)?;
            Ok(analysis::impact_count(graph, id))
        })
    }

    pub fn critical_path(&mut self, max_depth: usize) -> Result<CriticalPath> {
        self.with_graph(|graph, tasks| Ok(analysis::critical_path(graph, tasks, max_depth)))
    }

    pub fn rank_blockers(&mut self) -> Result<Vec<BlockerRank>> {
        self.with_graph(|graph, tasks| Ok(analysis::rank_blockers(graph, tasks)))
    }

    /// How many times this engine has rebuilt its graph
    pub fn graph_rebuilds(&self) -> usize {
        self.cache.rebuilds()
    }

    fn record(&self, entry: AuditEntry) {
        // The change is already committed; a lost log line must not fail it
        if let Err(e) = self.audit.append(&entry) {
            tracing::warn!(action = %entry.action, "failed to append audit entry: {}", e);
        }
    }
}

fn require(graph: &DependencyGraph, id: &TaskId) -> Result<()> {
    if graph.contains(id) {
        Ok(())
    } else {
        Err(StoreError::TaskNotFound(id.clone()))
    }
}

fn read_value(path: &Path) -> Result<Value> {
    let bytes = atomic::read_bytes(path)?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_store(path: &Path, doc: Value) -> Result<TaskStore> {
    serde_json::from_value(doc).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes must not paper over a hand edit
fn refuse_mismatch(path: &Path, doc: &Value) -> Result<()> {
    match integrity::verify_document(doc) {
        IntegrityStatus::Valid { .. } => Ok(()),
        IntegrityStatus::Missing { actual } => Err(StoreError::ChecksumMismatch {
            path: path.to_path_buf(),
            recorded: String::new(),
            actual,
        }),
        IntegrityStatus::Mismatch { recorded, actual } => Err(StoreError::ChecksumMismatch {
            path: path.to_path_buf(),
            recorded,
            actual,
        }),
    }
}

/// Move `task` to `status`, keeping completedAt and blockedBy consistent
fn apply_status(
    task: &mut Task,
    status: TaskStatus,
    blocked_by: Option<String>,
    now: DateTime<Utc>,
) -> Result<()> {
    match status {
        TaskStatus::Blocked => {
            let reason = blocked_by
                .or_else(|| task.blocked_by.clone())
                .filter(|r| !r.trim().is_empty())
                .ok_or_else(|| {
                    StoreError::InvalidOperation(format!(
                        "blocking {} requires a reason",
                        task.id
                    ))
                })?;
            task.blocked_by = Some(reason);
            task.completed_at = None;
        }
        other => {
            if blocked_by.is_some() {
                return Err(StoreError::InvalidOperation(format!(
                    "a blocked reason only applies to blocked tasks, not {}",
                    other
                )));
            }
            task.blocked_by = None;
            if other.is_terminal() {
                if task.status != other || task.completed_at.is_none() {
                    task.completed_at = Some(now);
                }
            } else {
                task.completed_at = None;
            }
        }
    }
    task.status = status;
    Ok(())
}
