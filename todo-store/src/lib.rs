// todo-store: durable, crash-safe JSON task store
//
// Layers, bottom up: locking and atomic writes, integrity checksums, schema
// validation, two-tier backups, schema migrations, the dependency graph, and
// the engine that runs every mutation through them.

pub mod atomic;
pub mod audit;
pub mod backup;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod integrity;
pub mod lock;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod validate;

pub use config::StoreConfig;
pub use engine::{NewTask, StoreEngine, TaskUpdate};
pub use error::{ErrorKind, Result, StoreError};
pub use model::{Priority, Task, TaskId, TaskStatus, TaskStore};
