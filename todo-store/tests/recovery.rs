//! Integration tests for backups, compaction and schema migration
//!
//! Run with: cargo test --test recovery

mod helpers;

use chrono::Duration;
use helpers::fixture::{id, TempStore};
use serde_json::{json, Value};
use todo_store_lib::backup::BackupKind;
use todo_store_lib::engine::TaskUpdate;
use todo_store_lib::integrity;
use todo_store_lib::model::{Task, TaskStatus};
use todo_store_lib::StoreError;

fn legacy_store() -> Value {
    json!({
        "version": "2.0.0",
        "project": "legacy",
        "tasks": [
            {"id": "T001", "title": "Sketch", "status": "done",
             "createdAt": "2026-01-05T09:00:00Z", "completedAt": "2026-01-06T09:00:00Z"},
            {"id": "T002", "title": "Build", "status": "in_progress",
             "dependencies": ["T001"], "createdAt": "2026-01-05T09:05:00Z"},
            {"id": "T007", "title": "Ship", "status": "blocked",
             "depends": ["T002"], "dependencies": ["T001"], "createdAt": "2026-01-05T09:10:00Z"}
        ]
    })
}

fn legacy_archive() -> Value {
    json!({
        "version": "2.0.0",
        "tasks": [
            {"id": "T003", "title": "Old spike", "status": "cancelled",
             "createdAt": "2026-01-01T09:00:00Z", "completedAt": "2026-01-02T09:00:00Z"}
        ]
    })
}

fn titles(tasks: &[Task]) -> Vec<(String, TaskStatus)> {
    tasks.iter().map(|t| (t.title.clone(), t.status)).collect()
}

#[test]
fn test_safety_backup_restores_pre_compaction_tasks() {
    let store = TempStore::initialized();
    store.add_tasks(4);
    let mut engine = store.engine();
    engine.complete_task(&id(1)).unwrap();
    engine
        .update_task(
            &id(3),
            TaskUpdate {
                status: Some(TaskStatus::Cancelled),
                ..TaskUpdate::default()
            },
        )
        .unwrap();
    store.clock.advance(Duration::days(30));

    let before = engine.load().unwrap().store.tasks;
    let report = engine.archive_completed(None).unwrap();
    assert_eq!(report.archived, vec![id(1), id(3)]);
    assert_eq!(engine.load().unwrap().store.tasks.len(), 2);

    let safety = report.safety_backup.unwrap();
    assert!(safety.starts_with("safety."));
    let outcome = engine.restore_backup(&safety).unwrap();
    assert_eq!(outcome.restored.id, safety);
    assert!(outcome.safety.is_some());

    let restored = engine.load().unwrap();
    assert!(restored.integrity.is_valid());
    assert_eq!(restored.store.tasks, before);
    assert_eq!(titles(&restored.store.tasks), titles(&before));
    // The archive went back too, so no id lives in both files
    assert!(engine.load_archive().unwrap().tasks.is_empty());
    assert!(engine.validate().unwrap().is_ok());
}

#[test]
fn test_snapshot_backups_listed_newest_first() {
    let store = TempStore::initialized();
    let engine = store.engine();

    let first = engine.create_backup(BackupKind::Snapshot).unwrap();
    store.clock.advance(Duration::minutes(5));
    let second = engine.create_backup(BackupKind::Snapshot).unwrap();

    let listed: Vec<String> = engine
        .list_backups(Some(BackupKind::Snapshot))
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(listed, vec![second.id.clone(), first.id.clone()]);
    assert_eq!(second.files.len(), 2);
}

#[test]
fn test_tampered_backup_is_not_restored() {
    let store = TempStore::initialized();
    store.add_tasks(1);
    let mut engine = store.engine();
    let record = engine.create_backup(BackupKind::Snapshot).unwrap();
    let todo_copy = record
        .files
        .iter()
        .find(|f| f.source == "todo.json")
        .unwrap();
    std::fs::write(&todo_copy.path, b"{\"tasks\": []}").unwrap();
    let before = store.todo_bytes();

    let err = engine.restore_backup(&record.id).unwrap_err();
    assert!(matches!(err, StoreError::BackupCorrupt { .. }));
    assert_eq!(store.todo_bytes(), before);

    let missing = engine.restore_backup("snapshot.19700101T000000000Z").unwrap_err();
    assert!(matches!(missing, StoreError::BackupNotFound(_)));
}

#[test]
fn test_legacy_store_migrates_on_first_use() {
    let store = TempStore::new();
    store.write_raw(&store.todo_path(), &legacy_store());
    store.write_raw(&store.archive_path(), &legacy_archive());

    let mut engine = store.engine();
    let reports = engine.ensure_compatible_version().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].applied.len(), 3);
    assert_eq!(reports[1].applied.len(), 2);
    assert!(reports[0].backup_id.as_deref().unwrap().starts_with("migration."));

    let doc = store.todo_value();
    assert_eq!(doc["_meta"]["schemaVersion"], "2.3.0");
    assert_eq!(doc["nextId"], 8);
    assert!(doc.get("version").is_none());
    assert!(integrity::verify_document(&doc).is_valid());

    let loaded = engine.load().unwrap().store;
    assert_eq!(loaded.project.name, "legacy");
    let build = loaded.get(&id(2)).unwrap();
    assert_eq!(build.status, TaskStatus::Active);
    assert!(build.depends.contains(&id(1)));
    let ship = loaded.get(&id(7)).unwrap();
    assert_eq!(ship.depends, [id(1), id(2)].into_iter().collect());
    assert_eq!(ship.blocked_by.as_deref(), Some("reason not recorded"));

    // New ids skip both the active store and the archive
    let next = engine
        .add_task(todo_store_lib::NewTask::titled("after migration"))
        .unwrap();
    assert_eq!(next.id, id(8));
}

#[test]
fn test_migration_is_idempotent() {
    let store = TempStore::new();
    store.write_raw(&store.todo_path(), &legacy_store());
    let mut engine = store.engine();

    engine.ensure_compatible_version().unwrap();
    let migrated = store.todo_bytes();
    let backups = engine.list_backups(Some(BackupKind::Migration)).unwrap().len();

    let again = engine.ensure_compatible_version().unwrap();
    assert!(again.iter().all(|r| r.is_noop()));
    assert_eq!(store.todo_bytes(), migrated);
    assert_eq!(
        engine.list_backups(Some(BackupKind::Migration)).unwrap().len(),
        backups
    );
}

#[test]
fn test_store_from_newer_engine_is_refused() {
    let store = TempStore::new();
    store.write_raw(
        &store.todo_path(),
        &json!({"tasks": [], "_meta": {"schemaVersion": "3.0.0", "checksum": ""}, "nextId": 1}),
    );
    let before = store.todo_bytes();

    let err = store.engine().load().unwrap_err();
    assert!(matches!(err, StoreError::VersionTooNew { .. }));
    assert_eq!(store.todo_bytes(), before);
}

#[test]
fn test_audit_log_tracks_archive_and_restore() {
    let store = TempStore::initialized();
    store.add_tasks(1);
    let mut engine = store.engine();
    engine.complete_task(&id(1)).unwrap();
    store.clock.advance(Duration::days(8));
    let report = engine.archive_completed(None).unwrap();
    engine.restore_backup(report.safety_backup.as_deref().unwrap()).unwrap();

    let actions: Vec<String> = engine
        .audit_log()
        .read_all()
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec!["init", "add", "complete", "archive", "restore"]
    );
}

#[test]
fn test_restore_of_backup_past_its_retention_window() {
    let store = TempStore::initialized();
    store.add_tasks(1);
    let mut engine = store.engine();
    let old = engine.create_backup(BackupKind::Safety).unwrap();

    store.clock.advance(Duration::days(10));
    engine
        .update_task(
            &id(1),
            TaskUpdate {
                title: Some("renamed later".to_string()),
                ..TaskUpdate::default()
            },
        )
        .unwrap();

    let outcome = engine.restore_backup(&old.id).unwrap();
    assert_eq!(engine.load().unwrap().store.get(&id(1)).unwrap().title, "task 1");
    assert!(engine.load_archive().unwrap().tasks.is_empty());

    // Taking the restore's own safety backup must not prune the one restored
    let listed: Vec<String> = engine
        .list_backups(Some(BackupKind::Safety))
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert!(listed.contains(&old.id));
    assert!(listed.contains(&outcome.safety.unwrap().id));
}

#[test]
fn test_failed_restore_leaves_both_files_untouched() {
    let store = TempStore::initialized();
    store.add_tasks(2);
    let mut engine = store.engine();
    let record = engine.create_backup(BackupKind::Snapshot).unwrap();
    for file in &record.files {
        if file.source == "todo-archive.json" {
            std::fs::remove_file(&file.path).unwrap();
        }
    }

    engine.complete_task(&id(2)).unwrap();
    let todo_before = store.todo_bytes();
    let archive_before = std::fs::read(store.archive_path()).unwrap();

    let err = engine.restore_backup(&record.id).unwrap_err();
    assert!(matches!(err, StoreError::BackupCorrupt { .. }));
    assert_eq!(store.todo_bytes(), todo_before);
    assert_eq!(std::fs::read(store.archive_path()).unwrap(), archive_before);
    assert!(engine
        .list_backups(Some(BackupKind::Safety))
        .unwrap()
        .is_empty());
}
