use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use todo_store_lib::clock::ManualClock;
use todo_store_lib::config::StoreConfig;
use todo_store_lib::lock::FileLockManager;
use todo_store_lib::model::TaskId;
use todo_store_lib::validate::StoreSchemaValidator;
use todo_store_lib::{NewTask, StoreEngine};

/// Temporary store directory with a controllable clock.
///
/// Each `engine()` call builds an independent engine with its own lock manager,
/// the way separate CLI invocations would.
pub struct TempStore {
    dir: TempDir,
    pub clock: ManualClock,
}

impl TempStore {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
            clock: ManualClock::new(start_time()),
        }
    }

    /// A store already initialized for project "demo"
    pub fn initialized() -> Self {
        let store = Self::new();
        store.engine().init("demo").expect("init store");
        store
    }

    pub fn store_dir(&self) -> PathBuf {
        self.dir.path().join(".todo")
    }

    pub fn config(&self) -> StoreConfig {
        StoreConfig::new(self.store_dir())
    }

    pub fn engine(&self) -> StoreEngine {
        StoreEngine::with_parts(
            self.config(),
            Arc::new(FileLockManager::new()),
            Arc::new(StoreSchemaValidator),
            Arc::new(self.clock.clone()),
        )
        .expect("open engine")
    }

    pub fn todo_path(&self) -> PathBuf {
        self.config().todo_file()
    }

    pub fn archive_path(&self) -> PathBuf {
        self.config().archive_file()
    }

    pub fn todo_bytes(&self) -> Vec<u8> {
        std::fs::read(self.todo_path()).expect("read todo.json")
    }

    pub fn todo_value(&self) -> Value {
        serde_json::from_slice(&self.todo_bytes()).expect("todo.json is JSON")
    }

    /// Write a raw document, bypassing the engine
    pub fn write_raw(&self, path: &PathBuf, doc: &Value) {
        std::fs::create_dir_all(self.store_dir()).expect("create store dir");
        std::fs::write(path, serde_json::to_vec_pretty(doc).expect("encode")).expect("write raw");
    }

    /// Add tasks titled "task 1", "task 2", ... and return their ids
    pub fn add_tasks(&self, count: u64) -> Vec<TaskId> {
        let mut engine = self.engine();
        (1..=count)
            .map(|n| {
                engine
                    .add_task(NewTask::titled(format!("task {}", n)))
                    .expect("add task")
                    .id
            })
            .collect()
    }
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-02-06T13:12:33Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub fn id(n: u64) -> TaskId {
    TaskId::new(n)
}
