//! Dependency graph engine
//!
//! The graph is derived from `tasks[].depends` and never persisted. Only edges
//! whose endpoints are both in the active store take part; a dependency on an
//! archived task is a dangling weak reference and is ignored here.
//!
//! A built graph is tagged with the checksum of the tasks it came from.
//! [`GraphCache`] compares that tag against a freshly computed checksum on
//! every access, so a write by this or any other process is picked up without
//! explicit invalidation.

pub mod analysis;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::Result;
use crate::integrity;
use crate::model::{Task, TaskId, TaskStore};

static NO_EDGES: BTreeSet<TaskId> = BTreeSet::new();

/// Forward and reverse adjacency over the active store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    /// task -> the tasks it depends on
    forward: BTreeMap<TaskId, BTreeSet<TaskId>>,
    /// task -> the tasks that depend on it
    reverse: BTreeMap<TaskId, BTreeSet<TaskId>>,
    checksum: String,
}

impl DependencyGraph {
    fn from_tasks(tasks: &[Task], checksum: String) -> Self {
        let mut forward: BTreeMap<TaskId, BTreeSet<TaskId>> = tasks
            .iter()
            .map(|t| (t.id.clone(), BTreeSet::new()))
            .collect();
        let mut reverse = forward.clone();

        for task in tasks {
            for dep in &task.depends {
                if !reverse.contains_key(dep) {
                    continue;
                }
                if let Some(out) = forward.get_mut(&task.id) {
                    out.insert(dep.clone());
                }
                if let Some(inc) = reverse.get_mut(dep) {
                    inc.insert(task.id.clone());
                }
            }
        }

        Self {
            forward,
            reverse,
            checksum,
        }
    }

    /// Checksum of the tasks this graph was built from
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.forward.contains_key(id)
    }

    /// Tasks `id` depends on
    pub fn forward_deps(&self, id: &TaskId) -> &BTreeSet<TaskId> {
        self.forward.get(id).unwrap_or(&NO_EDGES)
    }

    /// Tasks that depend on `id`
    pub fn reverse_deps(&self, id: &TaskId) -> &BTreeSet<TaskId> {
        self.reverse.get(id).unwrap_or(&NO_EDGES)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskId> {
        self.forward.keys()
    }

    pub fn node_count(&self) -> usize {
        self.forward.len()
    }

    pub fn edge_count(&self) -> usize {
        self.forward.values().map(BTreeSet::len).sum()
    }
}

/// Build the graph for `tasks`, tagged with their checksum
pub fn build_graph(tasks: &[Task]) -> Result<DependencyGraph> {
    let checksum = integrity::checksum_tasks(tasks)?;
    Ok(DependencyGraph::from_tasks(tasks, checksum))
}

/// Caller-owned cache of the last built graph
#[derive(Debug, Default)]
pub struct GraphCache {
    graph: Option<DependencyGraph>,
    rebuilds: usize,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph for `store`, rebuilt only if its tasks changed since the last call
    pub fn ensure(&mut self, store: &TaskStore) -> Result<&DependencyGraph> {
        let checksum = integrity::checksum_tasks(&store.tasks)?;
        let graph = match self.graph.take() {
            Some(graph) if graph.checksum == checksum => graph,
            _ => {
                tracing::debug!(checksum = %checksum, tasks = store.tasks.len(), "rebuilding dependency graph");
                self.rebuilds += 1;
                DependencyGraph::from_tasks(&store.tasks, checksum)
            }
        };
        Ok(self.graph.insert(graph))
    }

    pub fn invalidate(&mut self) {
        self.graph = None;
    }

    /// How many times the graph has been built
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }
}

/// If making `task` depend on `new_dep` would close a cycle, the cycle as
/// `[task, new_dep, ..., task]`. A self-dependency is `[task, task]`.
pub fn would_create_cycle(
    graph: &DependencyGraph,
    task: &TaskId,
    new_dep: &TaskId,
) -> Option<Vec<TaskId>> {
    if task == new_dep {
        return Some(vec![task.clone(), task.clone()]);
    }
    if !graph.contains(new_dep) || !graph.contains(task) {
        return None;
    }

    // BFS from new_dep along forward edges; reaching task closes the loop
    let mut came_from: HashMap<&TaskId, &TaskId> = HashMap::new();
    let mut visited: HashSet<&TaskId> = HashSet::new();
    let mut queue: VecDeque<&TaskId> = VecDeque::new();
    visited.insert(new_dep);
    queue.push_back(new_dep);

    while let Some(current) = queue.pop_front() {
        if current == task {
            let mut path = vec![current.clone()];
            let mut at = current;
            while let Some(prev) = came_from.get(at) {
                path.push((*prev).clone());
                at = prev;
            }
            path.push(task.clone());
            path.reverse();
            return Some(path);
        }
        for next in graph.forward_deps(current) {
            if visited.insert(next) {
                came_from.insert(next, current);
                queue.push_back(next);
            }
        }
    }
    None
}

/// Cycles among `tasks`, one per back edge of a depth-first walk, each as a
/// closed path starting at its smallest id. Empty for a valid store.
pub fn find_cycles(tasks: &[Task]) -> Vec<Vec<TaskId>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Visit {
        OnPath,
        Done,
    }

    let graph = DependencyGraph::from_tasks(tasks, String::new());
    let mut state: HashMap<&TaskId, Visit> = HashMap::new();
    let mut seen: BTreeSet<Vec<TaskId>> = BTreeSet::new();

    for root in graph.nodes() {
        if state.contains_key(root) {
            continue;
        }
        let mut path: Vec<&TaskId> = vec![root];
        let mut stack = vec![graph.forward_deps(root).iter()];
        state.insert(root, Visit::OnPath);

        while let Some(children) = stack.last_mut() {
            match children.next() {
                Some(child) => match state.get(child) {
                    None => {
                        state.insert(child, Visit::OnPath);
                        path.push(child);
                        stack.push(graph.forward_deps(child).iter());
                    }
                    Some(Visit::OnPath) => {
                        if let Some(start) = path.iter().position(|n| *n == child) {
                            seen.insert(normalize_cycle(&path[start..]));
                        }
                    }
                    Some(Visit::Done) => {}
                },
                None => {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        state.insert(done, Visit::Done);
                    }
                }
            }
        }
    }

    seen.into_iter().collect()
}

/// Rotate so the smallest id leads, then close the loop
fn normalize_cycle(nodes: &[&TaskId]) -> Vec<TaskId> {
    let start = nodes
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map_or(0, |(i, _)| i);
    let mut out: Vec<TaskId> = nodes[start..]
        .iter()
        .chain(&nodes[..start])
        .map(|id| (*id).clone())
        .collect();
    if let Some(first) = out.first().cloned() {
        out.push(first);
    }
    out
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Utc};

    use crate::model::{Task, TaskId, TaskStatus};

    pub fn id(n: u64) -> TaskId {
        TaskId::new(n)
    }

    /// Task `n` with the given status depending on `deps`
    pub fn task(n: u64, status: TaskStatus, deps: &[u64]) -> Task {
        let created = DateTime::parse_from_rfc3339("2026-02-06T13:12:33Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut t = Task::new(id(n), format!("task {}", n), created);
        t.status = status;
        t.depends = deps.iter().map(|d| id(*d)).collect();
        t
    }

    /// Linear chain: task n depends on task n-1
    pub fn chain(len: u64) -> Vec<Task> {
        (1..=len)
            .map(|n| {
                let deps: Vec<u64> = if n > 1 { vec![n - 1] } else { vec![] };
                task(n, TaskStatus::Pending, &deps)
            })
            .collect()
    }
}
