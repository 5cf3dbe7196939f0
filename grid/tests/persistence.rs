mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{init_logging, key, node_builder, value, EventLog, SEGMENTS};
use fibre_grid::config::EvictionStrategy;
use fibre_grid::distribution::KeyPartitioner;
use fibre_grid::persistence::{Characteristic, Characteristics, DummyInMemoryStore};
use fibre_grid::{GridError, LocalNetwork};

type Store = DummyInMemoryStore<String, String>;

fn store() -> Arc<Store> {
  Arc::new(DummyInMemoryStore::new(Characteristics::empty()))
}

#[test]
fn test_write_through_store() {
  init_logging();
  let network = LocalNetwork::new();
  let store = store();
  let node = node_builder("a", &network, 1).store(store.clone()).build().unwrap();

  for i in 0..10 {
    node.put(key(i), value(i)).unwrap();
  }
  assert_eq!(store.size(), 10);

  node.remove(&key(0)).unwrap();
  let segment = KeyPartitioner::new(SEGMENTS).segment(&key(0));
  assert!(!store.contains(segment, &key(0)));
  assert_eq!(store.size(), 9);
}

#[test]
fn test_eviction_passivates_and_reads_activate() {
  init_logging();
  let network = LocalNetwork::new();
  let store = store();
  let events = EventLog::new();
  let node = node_builder("a", &network, 1)
    .store(store.clone())
    .passivation(true)
    .max_count(5)
    .eviction(EvictionStrategy::Lru)
    .listener(events.clone())
    .build()
    .unwrap();

  for i in 0..10 {
    node.put(key(i), value(i)).unwrap();
  }
  assert_eq!(node.data_container().size(), 5);
  assert_eq!(store.size(), 5);
  let evicted: Vec<String> = events
    .events()
    .into_iter()
    .filter(|e| e.starts_with("evicted"))
    .collect();
  assert_eq!(evicted.len(), 5);
  assert_eq!(evicted[0], format!("evicted {} {}", key(0), value(0)));

  // Reading a passivated key brings it back and pushes another one out.
  assert_eq!(node.get(&key(0)).unwrap().as_deref(), Some(&value(0)));
  let segment = KeyPartitioner::new(SEGMENTS).segment(&key(0));
  assert!(!store.contains(segment, &key(0)));
  assert!(node.data_container().peek(&key(0)).is_some());
  assert_eq!(node.data_container().size(), 5);
  assert_eq!(store.size(), 5);

  let metrics = node.metrics();
  assert_eq!(metrics.evictions, 6);
  assert_eq!(metrics.passivations, 6);
  assert_eq!(metrics.activations, 1);

  for i in 0..10 {
    assert_eq!(node.get(&key(i)).unwrap().as_deref(), Some(&value(i)));
  }
}

#[test]
fn test_fifo_evicts_oldest_first() {
  let network = LocalNetwork::new();
  let node = node_builder("a", &network, 1)
    .max_count(3)
    .eviction(EvictionStrategy::Fifo)
    .build()
    .unwrap();

  for i in 0..3 {
    node.put(key(i), value(i)).unwrap();
  }
  // Reads do not protect an entry under FIFO.
  node.get(&key(0)).unwrap();
  node.put(key(3), value(3)).unwrap();

  assert!(node.data_container().peek(&key(0)).is_none());
  assert!(node.data_container().peek(&key(1)).is_some());
  assert_eq!(node.get(&key(0)).unwrap(), None, "no store, the entry is gone");
}

#[test]
fn test_preload_fills_memory_on_start() {
  init_logging();
  let network = LocalNetwork::new();
  let store = store();
  {
    let node = node_builder("a", &network, 1).store(store.clone()).build().unwrap();
    for i in 0..10 {
      node.put(key(i), value(i)).unwrap();
    }
    node.stop().unwrap();
  }
  assert_eq!(store.size(), 10);

  let node = node_builder("b", &network, 1)
    .store(store.clone())
    .preload(true)
    .build()
    .unwrap();
  assert_eq!(node.data_container().size(), 10);

  let loads_before = store.stats().loads.load(Ordering::Relaxed);
  for i in 0..10 {
    assert_eq!(node.get(&key(i)).unwrap().as_deref(), Some(&value(i)));
  }
  assert_eq!(store.stats().loads.load(Ordering::Relaxed), loads_before);
}

#[test]
fn test_shared_store_is_not_transferred() {
  init_logging();
  let network = LocalNetwork::new();
  let shared: Arc<Store> = Arc::new(DummyInMemoryStore::new(
    Characteristics::empty().with(Characteristic::Shareable),
  ));
  let a = node_builder("a", &network, 1).store(shared.clone()).build().unwrap();
  for i in 0..20 {
    a.put(key(i), value(i)).unwrap();
  }
  let b = node_builder("b", &network, 1).store(shared.clone()).build().unwrap();

  for i in 0..20 {
    assert_eq!(b.get(&key(i)).unwrap().as_deref(), Some(&value(i)));
  }
  // `a` dropped the segments it handed over from memory, but not from the store
  // both nodes share.
  assert_eq!(a.data_container().size() + b.data_container().size(), 20);
  assert_eq!(shared.size(), 20);
}

#[test]
fn test_failed_passivation_keeps_the_victim_in_memory() {
  init_logging();
  let network = LocalNetwork::new();
  let store = store();
  let events = EventLog::new();
  let node = node_builder("a", &network, 1)
    .store(store.clone())
    .passivation(true)
    .max_count(1)
    .eviction(EvictionStrategy::Lru)
    .listener(events.clone())
    .build()
    .unwrap();

  node.put(key(0), value(0)).unwrap();
  store.fail_writes(true);
  // The write itself succeeds; only the eviction it triggers cannot complete.
  node.put(key(1), value(1)).unwrap();

  assert!(node.data_container().peek(&key(0)).is_some());
  assert_eq!(node.get(&key(0)).unwrap().as_deref(), Some(&value(0)));
  assert_eq!(node.data_container().size(), 2);
  assert_eq!(store.size(), 0);
  let metrics = node.metrics();
  assert_eq!(metrics.evictions, 0);
  assert_eq!(metrics.passivations, 0);
  assert!(!events.events().iter().any(|e| e.starts_with("evicted")));

  // Once the store recovers, the next write brings the container back in bounds.
  store.fail_writes(false);
  node.put(key(2), value(2)).unwrap();
  assert_eq!(node.data_container().size(), 1);
  assert_eq!(store.size(), 2);
  assert_eq!(node.metrics().passivations, 2);
  for i in 0..3 {
    assert_eq!(node.get(&key(i)).unwrap().as_deref(), Some(&value(i)));
  }
}

#[test]
fn test_failed_store_write_leaves_memory_and_listeners_untouched() {
  let network = LocalNetwork::new();
  let store = store();
  let events = EventLog::new();
  let node = node_builder("a", &network, 1)
    .store(store.clone())
    .listener(events.clone())
    .build()
    .unwrap();
  node.put(key(0), value(0)).unwrap();
  events.clear();

  store.fail_writes(true);
  let err = node.put(key(0), "changed".into()).unwrap_err();
  assert!(matches!(err, GridError::Persistence(_)), "{:?}", err);
  let err = node.remove(&key(0)).unwrap_err();
  assert!(matches!(err, GridError::Persistence(_)), "{:?}", err);
  let err = node.put(key(1), value(1)).unwrap_err();
  assert!(matches!(err, GridError::Persistence(_)), "{:?}", err);

  assert!(events.events().is_empty(), "{:?}", events.events());
  assert_eq!(node.data_container().size(), 1);
  store.fail_writes(false);
  assert_eq!(node.get(&key(0)).unwrap().as_deref(), Some(&value(0)));
  assert_eq!(node.get(&key(1)).unwrap(), None);
  assert_eq!(store.size(), 1);
}

#[test]
fn test_commit_reports_writes_applied_before_a_failure() {
  init_logging();
  let network = LocalNetwork::new();
  let stores = [store(), store()];
  let nodes: Vec<_> = ["a", "b"]
    .iter()
    .zip(&stores)
    .map(|(name, store)| node_builder(name, &network, 1).store(store.clone()).build().unwrap())
    .collect();
  let owned_by = |i: usize| {
    (0..)
      .map(key)
      .find(|k| &nodes[0].distribution().locate_primary_owner(k).unwrap() == nodes[i].address())
      .unwrap()
  };
  let (first, second) = (owned_by(0), owned_by(1));

  let mut tx = nodes[0].begin().unwrap();
  tx.put(first.clone(), "tx".into()).unwrap();
  tx.put(second.clone(), "tx".into()).unwrap();
  stores[1].fail_writes(true);
  let err = tx.commit().unwrap_err();
  match err {
    GridError::PartialCommit { applied, total, source } => {
      assert_eq!((applied, total), (1, 2));
      assert!(matches!(*source, GridError::Persistence(_)), "{:?}", source);
    }
    other => panic!("expected a partial commit, got {:?}", other),
  }
  stores[1].fail_writes(false);

  assert_eq!(nodes[1].get(&first).unwrap().as_deref().map(String::as_str), Some("tx"));
  assert_eq!(nodes[0].get(&second).unwrap(), None);
  // Locks were released despite the failure.
  nodes[1].put(second.clone(), "after".into()).unwrap();
  for node in &nodes {
    assert_eq!(node.lock_manager().locked_count(), 0);
  }
}
