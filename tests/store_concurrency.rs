//! Concurrent writers against one on-disk store.
//!
//! Every writer opens its own `StateStore` handle on the shared root, the
//! same way independent CLI processes would.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use foreman::profile::WorkerProfile;
use foreman::store::{AgentFilter, NewAgent, NewTask, StateStore, StoreOptions};
use tempfile::TempDir;

const WRITERS: usize = 12;

#[test]
fn test_concurrent_creators_get_distinct_agents() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join(".foreman");
    StateStore::open(&root, StoreOptions::default()).unwrap();
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let root = root.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = StateStore::open(root, StoreOptions::default()).unwrap();
                barrier.wait();
                store
                    .create_agent(NewAgent::new(
                        WorkerProfile::Backend,
                        "Add user authentication",
                    ))
                    .unwrap()
                    .id
            })
        })
        .collect();

    let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let distinct: HashSet<&String> = ids.iter().collect();
    assert_eq!(distinct.len(), WRITERS, "duplicate ids: {ids:?}");

    let store = StateStore::open(&root, StoreOptions::default()).unwrap();
    let stored = store.list_agents(&AgentFilter::default(), None).unwrap();
    assert_eq!(stored.len(), WRITERS);
    for id in &ids {
        let agent = store.get_agent(id).unwrap();
        assert_eq!(agent.description, "Add user authentication");
        assert!(agent.result_dir.is_dir());
    }
}

#[test]
fn test_concurrent_updates_are_not_lost() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join(".foreman");
    let task = StateStore::open(&root, StoreOptions::default())
        .unwrap()
        .create_task(NewTask::new("shared task"))
        .unwrap();
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let root = root.clone();
            let task_id = task.id.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = StateStore::open(root, StoreOptions::default()).unwrap();
                barrier.wait();
                store
                    .update_task(&task_id, |t| {
                        t.metadata.insert(format!("writer-{i}"), i.into());
                    })
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let store = StateStore::open(&root, StoreOptions::default()).unwrap();
    let task = store.get_task(&task.id).unwrap();
    for i in 0..WRITERS {
        assert_eq!(task.metadata[&format!("writer-{i}")], i);
    }
}

#[test]
fn test_concurrent_task_creation() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join(".foreman");
    StateStore::open(&root, StoreOptions::default()).unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let root = root.clone();
            thread::spawn(move || {
                let store = StateStore::open(root, StoreOptions::default()).unwrap();
                store.create_task(NewTask::new(format!("task {i}"))).unwrap().id
            })
        })
        .collect();
    let ids: HashSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let store = StateStore::open(&root, StoreOptions::default()).unwrap();
    assert_eq!(ids.len(), WRITERS);
    assert_eq!(store.list_tasks(None).unwrap().len(), WRITERS);
}
