//! Task store document models (todo.json / todo-archive.json)

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};

static TASK_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^T(\d+)$").unwrap());

/// Task identifier
/// Format: "T" followed by digits, e.g. "T001", "T2674"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Build an id from its numeric part, zero-padded to three digits
    pub fn new(number: u64) -> Self {
        TaskId(format!("T{:03}", number))
    }

    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        if TASK_ID_RE.is_match(s) {
            Ok(TaskId(s.to_string()))
        } else {
            Err(format!("Invalid task id '{}': expected T<digits>", s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric part of the id (saturates on absurdly long digit runs)
    pub fn number(&self) -> u64 {
        self.0[1..].parse().unwrap_or(u64::MAX)
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.number()
            .cmp(&other.number())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl TryFrom<String> for TaskId {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        TaskId::parse(&value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TaskId::parse(s)
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Active,
    Blocked,
    Done,
    Cancelled,
}

impl TaskStatus {
    /// Done or cancelled; only terminal tasks may live in the archive
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Active => write!(f, "active"),
            TaskStatus::Blocked => write!(f, "blocked"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "active" => Ok(TaskStatus::Active),
            "blocked" => Ok(TaskStatus::Blocked),
            "done" => Ok(TaskStatus::Done),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Declared most urgent first, so `Ord` sorts critical before low
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// A single task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    /// Weak reference to the parent task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TaskId>,
    /// Weak references to the tasks this one waits on
    #[serde(default)]
    pub depends: BTreeSet<TaskId>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Reason the task is blocked (required iff status is blocked)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    /// Fields this version does not know about, preserved across rewrites
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Task {
    /// Create a pending task with minimal required fields
    pub fn new(id: TaskId, title: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title,
            description: None,
            status: TaskStatus::Pending,
            priority: Priority::default(),
            parent_id: None,
            depends: BTreeSet::new(),
            labels: BTreeSet::new(),
            phase: None,
            created_at,
            completed_at: None,
            blocked_by: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub phases: Vec<String>,
}

/// Pointer to the task an agent is currently working on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Focus {
    #[serde(default)]
    pub current_task: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub schema_version: String,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_session: Option<String>,
}

/// Root document persisted as todo.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStore {
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub project: Project,
    #[serde(default)]
    pub focus: Focus,
    #[serde(rename = "_meta")]
    pub meta: Meta,
    #[serde(rename = "nextId")]
    pub next_id: u64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TaskStore {
    /// Empty store; the checksum is filled in by the engine before the first write
    pub fn new(project_name: String, schema_version: &str) -> Self {
        Self {
            tasks: Vec::new(),
            project: Project {
                name: project_name,
                phases: Vec::new(),
            },
            focus: Focus::default(),
            meta: Meta {
                schema_version: schema_version.to_string(),
                checksum: String::new(),
                active_session: None,
            },
            next_id: 1,
            extra: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.get(id).is_some()
    }

    /// Allocate the next task id, skipping any id already taken here or in the archive
    pub fn allocate_id(&mut self, archived: &HashSet<TaskId>) -> Result<TaskId> {
        loop {
            let id = TaskId::new(self.next_id);
            self.next_id = self.next_id.checked_add(1).ok_or_else(|| {
                StoreError::InvalidOperation(format!("task id space exhausted at {}", id))
            })?;
            if !self.contains(&id) && !archived.contains(&id) {
                return Ok(id);
            }
        }
    }
}

/// Companion document persisted as todo-archive.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveStore {
    pub tasks: Vec<Task>,
    #[serde(rename = "_meta")]
    pub meta: Meta,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ArchiveStore {
    pub fn new(schema_version: &str) -> Self {
        Self {
            tasks: Vec::new(),
            meta: Meta {
                schema_version: schema_version.to_string(),
                checksum: String::new(),
                active_session: None,
            },
            extra: BTreeMap::new(),
        }
    }

    pub fn ids(&self) -> HashSet<TaskId> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }
}
