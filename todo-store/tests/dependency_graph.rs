//! Integration tests for dependency tracking through the engine
//!
//! Cycle rejection, depth bounds on long chains, and graph freshness across writes.
//!
//! Run with: cargo test --test dependency_graph

mod helpers;

use helpers::fixture::{id, start_time, TempStore};
use proptest::prelude::*;
use serde_json::Value;
use todo_store_lib::graph::{self, analysis::DEFAULT_MAX_DEPTH};
use todo_store_lib::integrity;
use todo_store_lib::model::{Task, TaskStore};
use todo_store_lib::StoreError;

/// Write a store holding a linear chain T001 <- T002 <- ... <- T<len>
fn write_chain(store: &TempStore, len: u64) {
    let mut doc = TaskStore::new("chain".to_string(), "2.3.0");
    for n in 1..=len {
        let mut task = Task::new(id(n), format!("step {}", n), start_time());
        if n > 1 {
            task.depends.insert(id(n - 1));
        }
        doc.tasks.push(task);
    }
    doc.next_id = len + 1;
    doc.meta.checksum = integrity::checksum_tasks(&doc.tasks).unwrap();
    let value = serde_json::to_value(&doc).unwrap();
    store.write_raw(&store.todo_path(), &value);
}

#[test]
fn test_transitive_cycle_is_rejected() {
    let store = TempStore::initialized();
    store.add_tasks(3);
    let mut engine = store.engine();
    engine.add_dependency(&id(2), &id(1)).unwrap();
    engine.add_dependency(&id(3), &id(2)).unwrap();
    let before = store.todo_bytes();

    let err = engine.add_dependency(&id(1), &id(3)).unwrap_err();
    match &err {
        StoreError::CircularDependency { cycle } => {
            assert_eq!(cycle.first(), Some(&id(1)));
            assert_eq!(cycle.last(), Some(&id(1)));
            assert!(cycle.contains(&id(3)));
        }
        other => panic!("expected CircularDependency, got {:?}", other),
    }
    assert_eq!(err.kind(), todo_store_lib::ErrorKind::Validation);
    assert_eq!(store.todo_bytes(), before);
}

#[test]
fn test_self_dependency_is_rejected() {
    let store = TempStore::initialized();
    store.add_tasks(1);
    let before = store.todo_bytes();

    let err = store.engine().add_dependency(&id(1), &id(1)).unwrap_err();
    assert!(matches!(err, StoreError::CircularDependency { ref cycle } if cycle == &vec![id(1), id(1)]));
    assert_eq!(store.todo_bytes(), before);
}

#[test]
fn test_chain_depth_on_long_chain_is_capped() {
    let store = TempStore::new();
    write_chain(&store, 500);
    let mut engine = store.engine();

    let depth = engine.chain_depth(&id(500), DEFAULT_MAX_DEPTH).unwrap();
    assert_eq!(depth.depth, 100);
    assert!(depth.truncated);

    let shallow = engine.chain_depth(&id(50), DEFAULT_MAX_DEPTH).unwrap();
    assert_eq!(shallow.depth, 49);
    assert!(!shallow.truncated);

    let critical = engine.critical_path(DEFAULT_MAX_DEPTH).unwrap();
    assert!(critical.truncated);
    assert_eq!(engine.impact_count(&id(1)).unwrap(), 499);
}

#[test]
fn test_forward_deps_reflect_each_write() {
    let store = TempStore::initialized();
    store.add_tasks(3);
    let mut engine = store.engine();

    assert!(engine.forward_deps(&id(3)).unwrap().is_empty());
    engine.add_dependency(&id(3), &id(1)).unwrap();
    assert_eq!(engine.forward_deps(&id(3)).unwrap(), vec![id(1)]);

    // A write from another engine (another process) is seen through the checksum
    store.engine().add_dependency(&id(3), &id(2)).unwrap();
    assert_eq!(engine.forward_deps(&id(3)).unwrap(), vec![id(1), id(2)]);
    assert_eq!(engine.reverse_deps(&id(2)).unwrap(), vec![id(3)]);

    store.engine().remove_dependency(&id(3), &id(1)).unwrap();
    assert_eq!(engine.forward_deps(&id(3)).unwrap(), vec![id(2)]);
}

#[test]
fn test_graph_is_not_rebuilt_without_a_write() {
    let store = TempStore::initialized();
    store.add_tasks(2);
    let mut engine = store.engine();

    engine.ready_tasks().unwrap();
    let rebuilds = engine.graph_rebuilds();
    engine.blocked_tasks().unwrap();
    engine.forward_deps(&id(1)).unwrap();
    assert_eq!(engine.graph_rebuilds(), rebuilds);

    engine.add_dependency(&id(2), &id(1)).unwrap();
    engine.forward_deps(&id(2)).unwrap();
    assert!(engine.graph_rebuilds() > rebuilds);
}

#[test]
fn test_would_create_cycle_is_a_dry_run() {
    let store = TempStore::initialized();
    store.add_tasks(2);
    let mut engine = store.engine();
    engine.add_dependency(&id(2), &id(1)).unwrap();
    let before = store.todo_bytes();

    let cycle = engine.would_create_cycle(&id(1), &id(2)).unwrap();
    assert_eq!(cycle, Some(vec![id(1), id(2), id(1)]));
    assert_eq!(engine.would_create_cycle(&id(2), &id(1)).unwrap(), None);
    assert_eq!(store.todo_bytes(), before);
}

#[test]
fn test_blockers_ranked_by_impact() {
    let store = TempStore::initialized();
    store.add_tasks(4);
    let mut engine = store.engine();
    engine.add_dependency(&id(2), &id(1)).unwrap();
    engine.add_dependency(&id(3), &id(2)).unwrap();
    engine.add_dependency(&id(4), &id(1)).unwrap();

    let ranked = engine.rank_blockers().unwrap();
    assert_eq!(ranked[0].id, id(1));
    assert_eq!(ranked[0].impact, 3);

    engine.complete_task(&id(1)).unwrap();
    let ready = engine.ready_tasks().unwrap();
    assert_eq!(ready, vec![id(2), id(4)]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Accepted edges never form a cycle; rejected ones never touch the file.
    #[test]
    fn accepted_dependencies_stay_acyclic(edges in prop::collection::vec((1u64..=5, 1u64..=5), 1..12)) {
        let store = TempStore::initialized();
        store.add_tasks(5);
        let mut engine = store.engine();

        for (task, dep) in edges {
            let before = store.todo_bytes();
            match engine.add_dependency(&id(task), &id(dep)) {
                Ok(_) => {
                    let doc: Value = store.todo_value();
                    prop_assert!(integrity::verify_document(&doc).is_valid());
                }
                Err(StoreError::CircularDependency { .. }) => {
                    prop_assert_eq!(store.todo_bytes(), before);
                }
                Err(other) => prop_assert!(false, "unexpected error: {:?}", other),
            }
        }

        let loaded = engine.load().unwrap();
        prop_assert!(graph::find_cycles(&loaded.store.tasks).is_empty());
    }
}
