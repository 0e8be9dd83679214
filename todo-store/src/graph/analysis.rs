//! Read-only analytics over a [`DependencyGraph`]
//!
//! Every traversal here is iterative with an explicit stack or queue and a
//! visited set, so a long chain costs heap, not call stack. Depth-bounded
//! queries stop at `max_depth` and say so through a `truncated` flag.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::Serialize;

use super::DependencyGraph;
use crate::model::{Priority, Task, TaskId, TaskStatus};

/// Default bound for depth-limited traversals
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Longest dependency chain below a task, in edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainDepth {
    pub depth: usize,
    /// The real chain is longer than `depth`
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriticalPath {
    /// Execution order: the first task has no unfinished dependency
    pub path: Vec<TaskId>,
    pub truncated: bool,
}

/// An unfinished task other unfinished work waits on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockerRank {
    pub id: TaskId,
    /// Number of tasks that transitively depend on it
    pub impact: usize,
}

struct Lookup<'a> {
    tasks: HashMap<&'a TaskId, &'a Task>,
}

impl<'a> Lookup<'a> {
    fn new(tasks: &'a [Task]) -> Self {
        Self {
            tasks: tasks.iter().map(|t| (&t.id, t)).collect(),
        }
    }

    fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    /// A dependency no longer in the active store was archived, so it counts as done
    fn dependency_satisfied(&self, id: &TaskId) -> bool {
        matches!(self.status(id), None | Some(TaskStatus::Done))
    }

    fn unfinished(&self, id: &TaskId) -> bool {
        self.status(id).is_some_and(|s| !s.is_terminal())
    }

    fn priority(&self, id: &TaskId) -> Priority {
        self.tasks.get(id).map(|t| t.priority).unwrap_or_default()
    }
}

/// Unfinished tasks that cannot start: explicitly blocked, or waiting on a
/// dependency that is not done. A cancelled dependency still blocks.
pub fn compute_blocked_tasks(graph: &DependencyGraph, tasks: &[Task]) -> Vec<TaskId> {
    let lookup = Lookup::new(tasks);
    let mut blocked: Vec<TaskId> = tasks
        .iter()
        .filter(|t| !t.status.is_terminal())
        .filter(|t| {
            t.status == TaskStatus::Blocked
                || graph
                    .forward_deps(&t.id)
                    .iter()
                    .any(|dep| !lookup.dependency_satisfied(dep))
        })
        .map(|t| t.id.clone())
        .collect();
    blocked.sort();
    blocked
}

/// Pending tasks whose dependencies are all done, most urgent first
pub fn ready_tasks(graph: &DependencyGraph, tasks: &[Task]) -> Vec<TaskId> {
    let lookup = Lookup::new(tasks);
    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            graph
                .forward_deps(&t.id)
                .iter()
                .all(|dep| lookup.dependency_satisfied(dep))
        })
        .collect();
    ready.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
    ready.into_iter().map(|t| t.id.clone()).collect()
}

/// Longest chain of dependencies below `id`, capped at `max_depth` edges
pub fn chain_depth(graph: &DependencyGraph, id: &TaskId, max_depth: usize) -> ChainDepth {
    if !graph.contains(id) {
        return ChainDepth {
            depth: 0,
            truncated: false,
        };
    }
    let capped = ChainDepth {
        depth: max_depth,
        truncated: true,
    };

    // Memoized height (edges) of every fully explored node
    let mut height: HashMap<&TaskId, usize> = HashMap::new();
    let mut on_path: HashSet<&TaskId> = HashSet::new();
    let mut stack = vec![(id, graph.forward_deps(id).iter())];
    on_path.insert(id);

    while let Some((node, children)) = stack.last_mut() {
        let node = *node;
        match children.next() {
            Some(child) => {
                // stack.len() is the depth of `child` below the root
                if let Some(h) = height.get(child) {
                    if stack.len() + h > max_depth {
                        return capped;
                    }
                    continue;
                }
                if on_path.contains(child) {
                    // Cycle in a hand-edited store; the edge adds nothing
                    continue;
                }
                if stack.len() > max_depth {
                    return capped;
                }
                on_path.insert(child);
                stack.push((child, graph.forward_deps(child).iter()));
            }
            None => {
                stack.pop();
                on_path.remove(node);
                let h = graph
                    .forward_deps(node)
                    .iter()
                    .filter_map(|c| height.get(c))
                    .map(|h| h + 1)
                    .max()
                    .unwrap_or(0);
                height.insert(node, h);
            }
        }
    }

    ChainDepth {
        depth: height.get(id).copied().unwrap_or(0),
        truncated: false,
    }
}

/// Number of tasks that transitively depend on `id`
pub fn impact_count(graph: &DependencyGraph, id: &TaskId) -> usize {
    let mut visited: HashSet<&TaskId> = HashSet::new();
    let mut queue: VecDeque<&TaskId> = graph.reverse_deps(id).iter().collect();
    visited.extend(queue.iter().copied());
    visited.insert(id);
    let mut count = 0;

    while let Some(current) = queue.pop_front() {
        count += 1;
        for dependent in graph.reverse_deps(current) {
            if visited.insert(dependent) {
                queue.push_back(dependent);
            }
        }
    }
    count
}

/// Longest chain of unfinished tasks, at most `max_depth` edges long
pub fn critical_path(graph: &DependencyGraph, tasks: &[Task], max_depth: usize) -> CriticalPath {
    let lookup = Lookup::new(tasks);
    let unfinished: BTreeSet<&TaskId> = graph.nodes().filter(|id| lookup.unfinished(id)).collect();

    // Post-order heights over the unfinished subgraph, remembering the deepest child
    let mut height: HashMap<&TaskId, usize> = HashMap::new();
    let mut next: HashMap<&TaskId, &TaskId> = HashMap::new();
    let mut on_path: HashSet<&TaskId> = HashSet::new();

    for root in &unfinished {
        if height.contains_key(root) {
            continue;
        }
        let mut stack = vec![(*root, graph.forward_deps(root).iter())];
        on_path.insert(*root);

        while let Some((node, children)) = stack.last_mut() {
            let node = *node;
            match children.next() {
                Some(child) => {
                    if !unfinished.contains(child)
                        || height.contains_key(child)
                        || on_path.contains(child)
                    {
                        continue;
                    }
                    on_path.insert(child);
                    stack.push((child, graph.forward_deps(child).iter()));
                }
                None => {
                    stack.pop();
                    on_path.remove(node);
                    let deepest = graph
                        .forward_deps(node)
                        .iter()
                        .filter_map(|c| height.get(c).map(|h| (c, *h)))
                        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)));
                    match deepest {
                        Some((child, h)) => {
                            height.insert(node, h + 1);
                            next.insert(node, child);
                        }
                        None => {
                            height.insert(node, 0);
                        }
                    }
                }
            }
        }
    }

    // Deepest start; ties go to the smallest id
    let Some(start) = unfinished
        .iter()
        .copied()
        .max_by(|a, b| height[a].cmp(&height[b]).then_with(|| b.cmp(a)))
    else {
        return CriticalPath {
            path: Vec::new(),
            truncated: false,
        };
    };

    let mut path = vec![start.clone()];
    let mut at = start;
    while let Some(child) = next.get(at) {
        if path.len() > max_depth {
            break;
        }
        path.push((*child).clone());
        at = child;
    }
    path.reverse();

    CriticalPath {
        path,
        truncated: height[start] > max_depth,
    }
}

/// Unfinished tasks that unfinished work waits on, by impact then priority then id
pub fn rank_blockers(graph: &DependencyGraph, tasks: &[Task]) -> Vec<BlockerRank> {
    let lookup = Lookup::new(tasks);
    let mut ranks: Vec<BlockerRank> = graph
        .nodes()
        .filter(|id| lookup.unfinished(id))
        .filter(|id| graph.reverse_deps(id).iter().any(|d| lookup.unfinished(d)))
        .map(|id| BlockerRank {
            id: id.clone(),
            impact: impact_count(graph, id),
        })
        .collect();
    ranks.sort_by(|a, b| {
        b.impact
            .cmp(&a.impact)
            .then_with(|| lookup.priority(&a.id).cmp(&lookup.priority(&b.id)))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranks
}
