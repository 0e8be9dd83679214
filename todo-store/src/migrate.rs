//! Schema migration engine
//!
//! Every migration step is registered explicitly under `(file type, target
//! version)` and declares the version it starts from, so a missing link in the
//! chain is caught when the registry is built instead of halfway through a
//! migration. Steps are pure `Value -> Value` rewrites and idempotent; the
//! driver stamps `_meta.schemaVersion` and a freshly computed checksum after
//! each one and commits the intermediate document through the atomic writer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::atomic::{self, AtomicWriter};
use crate::backup::{BackupKind, BackupManager};
use crate::error::{Result, StoreError};
use crate::integrity;
use crate::validate::{SCHEMA_ARCHIVE, SCHEMA_TODO};

/// `major.minor.patch` schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Version assumed for files that carry no version marker at all
    pub const OLDEST: SchemaVersion = SchemaVersion::new(2, 0, 0);
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::str::FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        let [major, minor, patch] = parts.as_slice() else {
            return Err(format!("Invalid schema version '{}': expected X.Y.Z", s));
        };
        let num = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| format!("Invalid schema version '{}': expected X.Y.Z", s))
        };
        Ok(SchemaVersion::new(num(major)?, num(minor)?, num(patch)?))
    }
}

/// Which store document a migration applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileType {
    Todo,
    Archive,
}

impl FileType {
    pub const ALL: [FileType; 2] = [FileType::Todo, FileType::Archive];

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Todo => "todo",
            FileType::Archive => "archive",
        }
    }

    /// Schema name the validator checks this file type against
    pub fn schema(self) -> &'static str {
        match self {
            FileType::Todo => SCHEMA_TODO,
            FileType::Archive => SCHEMA_ARCHIVE,
        }
    }

    /// Version this build of the engine reads and writes
    pub fn current_version(self) -> SchemaVersion {
        match self {
            FileType::Todo => SchemaVersion::new(2, 3, 0),
            FileType::Archive => SchemaVersion::new(2, 2, 0),
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure document rewrite for one version step
pub type StepFn = fn(&mut Value) -> std::result::Result<(), String>;

#[derive(Clone)]
pub struct MigrationStep {
    pub file_type: FileType,
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub description: &'static str,
    apply: StepFn,
}

impl MigrationStep {
    pub fn new(
        file_type: FileType,
        from: SchemaVersion,
        to: SchemaVersion,
        description: &'static str,
        apply: StepFn,
    ) -> Self {
        Self {
            file_type,
            from,
            to,
            description,
            apply,
        }
    }

    /// Name used in errors and logs, e.g. `todo 2.1.0 -> 2.2.0`
    pub fn name(&self) -> String {
        format!("{} {} -> {}", self.file_type, self.from, self.to)
    }

    pub fn apply(&self, doc: &mut Value) -> std::result::Result<(), String> {
        (self.apply)(doc)
    }
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("step", &self.name())
            .field("description", &self.description)
            .finish()
    }
}

/// Explicit `(file type, target version) -> step` map
#[derive(Debug, Default, Clone)]
pub struct MigrationRegistry {
    steps: BTreeMap<(FileType, SchemaVersion), MigrationStep>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The steps shipped with this engine, validated end to end
    pub fn builtin() -> Result<Self> {
        let v = SchemaVersion::new;
        let mut registry = Self::new();
        registry.register(MigrationStep::new(
            FileType::Todo,
            v(2, 0, 0),
            v(2, 1, 0),
            "move top-level version into _meta",
            introduce_meta,
        ))?;
        registry.register(MigrationStep::new(
            FileType::Todo,
            v(2, 1, 0),
            v(2, 2, 0),
            "rename dependencies to depends, in_progress to active, default labels",
            normalize_tasks,
        ))?;
        registry.register(MigrationStep::new(
            FileType::Todo,
            v(2, 2, 0),
            v(2, 3, 0),
            "add nextId, focus and project phases",
            add_allocation_and_focus,
        ))?;
        registry.register(MigrationStep::new(
            FileType::Archive,
            v(2, 0, 0),
            v(2, 1, 0),
            "move top-level version into _meta",
            introduce_meta,
        ))?;
        registry.register(MigrationStep::new(
            FileType::Archive,
            v(2, 1, 0),
            v(2, 2, 0),
            "rename dependencies to depends, default labels",
            normalize_tasks,
        ))?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn register(&mut self, step: MigrationStep) -> Result<()> {
        if step.from >= step.to {
            return Err(StoreError::MigrationGap {
                file_type: step.file_type.to_string(),
                from: step.from.to_string(),
                to: step.to.to_string(),
                reason: "step does not move forward".to_string(),
            });
        }
        let key = (step.file_type, step.to);
        if self.steps.contains_key(&key) {
            return Err(StoreError::MigrationGap {
                file_type: step.file_type.to_string(),
                from: step.from.to_string(),
                to: step.to.to_string(),
                reason: "duplicate step for this target version".to_string(),
            });
        }
        self.steps.insert(key, step);
        Ok(())
    }

    /// Every file type must chain contiguously from the oldest version to its current one
    pub fn validate(&self) -> Result<()> {
        for file_type in FileType::ALL {
            self.plan(file_type, SchemaVersion::OLDEST, file_type.current_version())?;
        }
        Ok(())
    }

    /// Registered target versions for `file_type`, ascending
    pub fn discover_migrations(&self, file_type: FileType) -> Vec<SchemaVersion> {
        self.steps
            .keys()
            .filter(|(ft, _)| *ft == file_type)
            .map(|(_, to)| *to)
            .collect()
    }

    /// Ordered steps taking `file_type` from `from` to `to`
    pub fn plan(
        &self,
        file_type: FileType,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> Result<Vec<&MigrationStep>> {
        let gap = |reason: String| StoreError::MigrationGap {
            file_type: file_type.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            reason,
        };
        if from > to {
            return Err(gap("downgrades are not supported".to_string()));
        }

        let mut plan = Vec::new();
        let mut at = from;
        for ((ft, target), step) in &self.steps {
            if *ft != file_type || *target <= from || *target > to {
                continue;
            }
            if step.from != at {
                return Err(gap(format!(
                    "no step from {} (next registered step starts at {})",
                    at, step.from
                )));
            }
            plan.push(step);
            at = step.to;
        }
        if at != to {
            return Err(gap(format!("chain stops at {}", at)));
        }
        Ok(plan)
    }
}

/// Schema version recorded in a raw document: `_meta.schemaVersion`, then a
/// legacy top-level `version`, then the oldest known version
pub fn detect_version_value(doc: &Value) -> std::result::Result<SchemaVersion, String> {
    let recorded = doc
        .get("_meta")
        .and_then(|m| m.get("schemaVersion"))
        .or_else(|| doc.get("version"));
    match recorded {
        None | Some(Value::Null) => Ok(SchemaVersion::OLDEST),
        Some(Value::String(s)) => s.parse(),
        Some(other) => Err(format!("schema version is not a string: {}", other)),
    }
}

/// Schema version of the file at `path`
pub fn detect_version(path: &Path) -> Result<SchemaVersion> {
    let doc = read_document(path)?;
    detect_version_value(&doc).map_err(|reason| StoreError::SchemaInvalid {
        path: path.to_path_buf(),
        schema: "version".to_string(),
        errors: vec![reason],
    })
}

fn read_document(path: &Path) -> Result<Value> {
    let bytes = atomic::read_bytes(path)?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// What a migration run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub path: PathBuf,
    pub file_type: FileType,
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    /// Target versions written, in order
    pub applied: Vec<SchemaVersion>,
    /// Tier 2 backup taken before the first step
    pub backup_id: Option<String>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Applies registered migrations to files on disk
pub struct Migrator {
    registry: MigrationRegistry,
    writer: Arc<AtomicWriter>,
    backups: Arc<BackupManager>,
}

impl Migrator {
    pub fn new(
        registry: MigrationRegistry,
        writer: Arc<AtomicWriter>,
        backups: Arc<BackupManager>,
    ) -> Self {
        Self {
            registry,
            writer,
            backups,
        }
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Migrate `path` from `from` to `to`, one committed write per step
    pub fn migrate(
        &self,
        path: &Path,
        file_type: FileType,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> Result<MigrationReport> {
        let mut report = MigrationReport {
            path: path.to_path_buf(),
            file_type,
            from,
            to,
            applied: Vec::new(),
            backup_id: None,
        };
        if from == to {
            return Ok(report);
        }
        // Fail on gaps before touching anything
        self.registry.plan(file_type, from, to)?;

        let guard = self.writer.lock(path)?;
        let mut doc = read_document(path)?;

        // Another process may have migrated while we waited for the lock
        let on_disk = detect_version_value(&doc).map_err(|reason| StoreError::MigrationFailed {
            path: path.to_path_buf(),
            step: format!("{} detect", file_type),
            reason,
        })?;
        if on_disk > to {
            return Err(StoreError::VersionTooNew {
                path: path.to_path_buf(),
                found: on_disk.to_string(),
                supported: to.to_string(),
            });
        }
        if on_disk < from {
            return Err(StoreError::InvalidOperation(format!(
                "{} is at {}, older than requested start {}",
                path.display(),
                on_disk,
                from
            )));
        }
        let steps = self.registry.plan(file_type, on_disk, to)?;
        if steps.is_empty() {
            return Ok(report);
        }
        // Restamping would silently accept a hand edit
        if let integrity::IntegrityStatus::Mismatch { recorded, actual } =
            integrity::verify_document(&doc)
        {
            return Err(StoreError::ChecksumMismatch {
                path: path.to_path_buf(),
                recorded,
                actual,
            });
        }

        // The caller holds this file's lock; the sibling file is copied as it stands
        report.backup_id = Some(self.backups.create_backup_held(BackupKind::Migration)?.id);

        for step in steps {
            let name = step.name();
            let failed = |reason: String| StoreError::MigrationFailed {
                path: path.to_path_buf(),
                step: name.clone(),
                reason,
            };

            step.apply(&mut doc).map_err(failed)?;
            stamp_meta(&mut doc, step.to).map_err(failed)?;

            let bytes = serde_json::to_vec_pretty(&doc)?;
            match self
                .writer
                .write_locked(&guard, path, &bytes, file_type.schema())
            {
                Ok(()) => {}
                Err(StoreError::SchemaInvalid { errors, .. }) => {
                    return Err(failed(errors.join("; ")));
                }
                Err(e) => return Err(e),
            }
            tracing::info!(path = %path.display(), step = %name, "applied migration step");
            report.applied.push(step.to);
        }

        Ok(report)
    }

    /// Bring `path` up to the current version of `file_type`.
    /// A file newer than this engine is refused; a current file is left untouched.
    pub fn ensure_compatible_version(
        &self,
        path: &Path,
        file_type: FileType,
    ) -> Result<MigrationReport> {
        let found = detect_version(path)?;
        let current = file_type.current_version();
        if found > current {
            return Err(StoreError::VersionTooNew {
                path: path.to_path_buf(),
                found: found.to_string(),
                supported: current.to_string(),
            });
        }
        self.migrate(path, file_type, found, current)
    }
}

/// Record the version just reached and a checksum over the tasks as they now are
fn stamp_meta(doc: &mut Value, version: SchemaVersion) -> std::result::Result<(), String> {
    let checksum = integrity::checksum_value(doc.get("tasks").unwrap_or(&json!([])));
    let meta = object_field(doc, "_meta")?;
    meta.insert("schemaVersion".to_string(), json!(version.to_string()));
    meta.insert("checksum".to_string(), json!(checksum));
    Ok(())
}

fn as_object(doc: &mut Value) -> std::result::Result<&mut Map<String, Value>, String> {
    doc.as_object_mut()
        .ok_or_else(|| "document is not a JSON object".to_string())
}

fn object_field<'a>(
    doc: &'a mut Value,
    key: &str,
) -> std::result::Result<&'a mut Map<String, Value>, String> {
    as_object(doc)?
        .entry(key)
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| format!("`{}` is not an object", key))
}

fn tasks_mut(doc: &mut Value) -> std::result::Result<&mut Vec<Value>, String> {
    as_object(doc)?
        .entry("tasks")
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| "`tasks` is not an array".to_string())
}

// ============================================================================
// Built-in steps
// ============================================================================

/// 2.0.0 -> 2.1.0: the version marker moves from the top level into `_meta`
fn introduce_meta(doc: &mut Value) -> std::result::Result<(), String> {
    as_object(doc)?.remove("version");
    let meta = object_field(doc, "_meta")?;
    meta.entry("checksum").or_insert_with(|| json!(""));
    tasks_mut(doc)?;
    Ok(())
}

/// 2.1.0 -> 2.2.0: task field renames and defaults
fn normalize_tasks(doc: &mut Value) -> std::result::Result<(), String> {
    for (i, task) in tasks_mut(doc)?.iter_mut().enumerate() {
        let task = task
            .as_object_mut()
            .ok_or_else(|| format!("tasks[{}] is not an object", i))?;

        if let Some(legacy) = task.remove("dependencies") {
            let mut depends: Vec<Value> = match task.remove("depends") {
                Some(Value::Array(existing)) => existing,
                _ => Vec::new(),
            };
            if let Value::Array(items) = legacy {
                for item in items {
                    if !depends.contains(&item) {
                        depends.push(item);
                    }
                }
            }
            task.insert("depends".to_string(), Value::Array(depends));
        }
        task.entry("depends").or_insert_with(|| json!([]));
        task.entry("labels").or_insert_with(|| json!([]));

        if task.get("status").and_then(Value::as_str) == Some("in_progress") {
            task.insert("status".to_string(), json!("active"));
        }
        let blocked = task.get("status").and_then(Value::as_str) == Some("blocked");
        if blocked && !task.get("blockedBy").is_some_and(Value::is_string) {
            task.insert("blockedBy".to_string(), json!("reason not recorded"));
        }
    }
    Ok(())
}

/// 2.2.0 -> 2.3.0: explicit id allocation, focus pointer, project phases
fn add_allocation_and_focus(doc: &mut Value) -> std::result::Result<(), String> {
    let max_id = tasks_mut(doc)?
        .iter()
        .filter_map(|t| t.get("id").and_then(Value::as_str))
        .filter_map(|id| id.strip_prefix('T').and_then(|n| n.parse::<u64>().ok()))
        .max()
        .unwrap_or(0);

    let after_max = max_id
        .checked_add(1)
        .ok_or_else(|| format!("task id T{} leaves no room for new ids", max_id))?;

    let obj = as_object(doc)?;
    let existing = obj.get("nextId").and_then(Value::as_u64).unwrap_or(0);
    obj.insert("nextId".to_string(), json!(existing.max(after_max)));
    obj.entry("focus")
        .or_insert_with(|| json!({"currentTask": null}));

    let project = obj.entry("project").or_insert_with(|| json!({"name": ""}));
    if let Value::String(name) = project {
        let name = std::mem::take(name);
        *project = json!({ "name": name });
    }
    let project = project
        .as_object_mut()
        .ok_or_else(|| "`project` is not an object".to_string())?;
    project.entry("name").or_insert_with(|| json!(""));
    project.entry("phases").or_insert_with(|| json!([]));
    Ok(())
}
