//! Schema validation for documents passing through the atomic write path

use std::collections::HashSet;

use serde_json::Value;

use crate::graph;
use crate::integrity::{self, IntegrityStatus};
use crate::migrate::{FileType, SchemaVersion};
use crate::model::{ArchiveStore, Task, TaskId, TaskStatus, TaskStore};

/// Schema name for `todo.json`
pub const SCHEMA_TODO: &str = "todo";
/// Schema name for `todo-archive.json`
pub const SCHEMA_ARCHIVE: &str = "archive";
/// Schema name for Tier 2 backup manifests
pub const SCHEMA_BACKUP: &str = "backup";

/// Validates raw document bytes against a named schema
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, content: &[u8], schema: &str) -> Result<(), Vec<String>>;
}

/// Built-in validator for the store's own documents
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreSchemaValidator;

impl SchemaValidator for StoreSchemaValidator {
    fn validate(&self, content: &[u8], schema: &str) -> Result<(), Vec<String>> {
        let doc: Value = serde_json::from_slice(content)
            .map_err(|e| vec![format!("not valid JSON: {}", e)])?;

        let errors = match schema {
            SCHEMA_TODO => validate_task_document(&doc, FileType::Todo),
            SCHEMA_ARCHIVE => validate_task_document(&doc, FileType::Archive),
            SCHEMA_BACKUP => validate_manifest(&doc),
            other => vec![format!("unknown schema '{}'", other)],
        };

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Accepts everything; for tests that exercise the write path alone
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopValidator;

impl SchemaValidator for NoopValidator {
    fn validate(&self, _content: &[u8], _schema: &str) -> Result<(), Vec<String>> {
        Ok(())
    }
}

fn validate_task_document(doc: &Value, file_type: FileType) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(obj) = doc.as_object() else {
        return vec!["document must be a JSON object".to_string()];
    };
    let Some(tasks) = obj.get("tasks").and_then(Value::as_array) else {
        return vec!["`tasks` must be an array".to_string()];
    };

    let mut seen = HashSet::new();
    for (i, task) in tasks.iter().enumerate() {
        match task.get("id").and_then(Value::as_str) {
            None => errors.push(format!("tasks[{}]: missing string `id`", i)),
            Some(raw) => match TaskId::parse(raw) {
                Err(e) => errors.push(format!("tasks[{}].id: {}", i, e)),
                Ok(id) => {
                    if !seen.insert(id) {
                        errors.push(format!("tasks[{}].id: duplicate id {}", i, raw));
                    }
                }
            },
        }
    }

    if obj.contains_key("_meta") {
        if let IntegrityStatus::Mismatch { recorded, actual } = integrity::verify_document(doc) {
            errors.push(format!(
                "_meta.checksum {} does not match tasks content ({})",
                recorded, actual
            ));
        }
    }

    // Older shapes only get the structural checks above; they are on their way through migration
    let version = doc
        .get("_meta")
        .and_then(|m| m.get("schemaVersion"))
        .and_then(Value::as_str)
        .and_then(|v| v.parse::<SchemaVersion>().ok());
    if version.as_ref() != Some(&file_type.current_version()) || !errors.is_empty() {
        return errors;
    }

    match file_type {
        FileType::Todo => match serde_json::from_value::<TaskStore>(doc.clone()) {
            Err(e) => errors.push(format!("todo document: {}", e)),
            Ok(store) => {
                check_task_rules(&store.tasks, &mut errors);
                if let Some(max) = store.tasks.iter().map(|t| t.id.number()).max() {
                    if store.next_id <= max {
                        errors.push(format!(
                            "nextId {} is not above the highest task id T{:03}",
                            store.next_id, max
                        ));
                    }
                }
                for cycle in graph::find_cycles(&store.tasks) {
                    let path: Vec<&str> = cycle.iter().map(TaskId::as_str).collect();
                    errors.push(format!("dependency cycle: {}", path.join(" -> ")));
                }
            }
        },
        FileType::Archive => match serde_json::from_value::<ArchiveStore>(doc.clone()) {
            Err(e) => errors.push(format!("archive document: {}", e)),
            Ok(archive) => {
                check_task_rules(&archive.tasks, &mut errors);
                for task in archive.tasks.iter().filter(|t| !t.status.is_terminal()) {
                    errors.push(format!(
                        "{}: archived task has non-terminal status {}",
                        task.id, task.status
                    ));
                }
            }
        },
    }

    errors
}

fn check_task_rules(tasks: &[Task], errors: &mut Vec<String>) {
    for task in tasks {
        let blocked = task.status == TaskStatus::Blocked;
        let has_reason = task
            .blocked_by
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty());
        if blocked && !has_reason {
            errors.push(format!("{}: status blocked requires blockedBy", task.id));
        }
        if !blocked && task.blocked_by.is_some() {
            errors.push(format!("{}: blockedBy set on a {} task", task.id, task.status));
        }
        if task.depends.contains(&task.id) {
            errors.push(format!("{}: task depends on itself", task.id));
        }
        if task.parent_id.as_ref() == Some(&task.id) {
            errors.push(format!("{}: task is its own parent", task.id));
        }
        if task.title.trim().is_empty() {
            errors.push(format!("{}: title is empty", task.id));
        }
    }
}

fn validate_manifest(doc: &Value) -> Vec<String> {
    let Some(obj) = doc.as_object() else {
        return vec!["manifest must be a JSON object".to_string()];
    };
    ["timestamp", "sourceChecksum", "type", "source", "contentChecksum"]
        .iter()
        .filter(|key| !obj.get(**key).is_some_and(Value::is_string))
        .map(|key| format!("manifest: missing string `{}`", key))
        .collect()
}
