mod common;

use common::{key, value, TestCluster};

#[test]
fn test_put_is_visible_from_every_node() {
  let cluster = TestCluster::start(3, 2);

  for i in 0..20 {
    let writer = cluster.node(i % 3);
    assert_eq!(writer.put(key(i), value(i)).unwrap(), None);
  }

  for node in &cluster.nodes {
    for i in 0..20 {
      assert_eq!(node.get(&key(i)).unwrap().as_deref(), Some(&value(i)), "{} on {}", key(i), node.address());
    }
  }
}

#[test]
fn test_every_key_has_num_owners_copies() {
  let cluster = TestCluster::start(3, 2);
  cluster.fill(50);

  for i in 0..50 {
    assert_eq!(cluster.copies_of(&key(i)), 2, "copies of {}", key(i));
  }
}

#[test]
fn test_replicas_share_one_version() {
  let cluster = TestCluster::start(3, 2);
  cluster.fill(10);

  for i in 0..10 {
    let versions: Vec<_> = cluster
      .nodes
      .iter()
      .filter_map(|n| n.data_container().peek(&key(i)))
      .map(|e| e.version().cloned().unwrap())
      .collect();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0], versions[1]);
  }
}

#[test]
fn test_overwrite_returns_previous_and_bumps_version() {
  let cluster = TestCluster::start(2, 2);
  let node = cluster.node(1);

  node.put("k".to_string(), "v1".to_string()).unwrap();
  let first = node.get_entry(&"k".to_string()).unwrap().unwrap();
  let previous = node.put("k".to_string(), "v2".to_string()).unwrap();
  let second = node.get_entry(&"k".to_string()).unwrap().unwrap();

  assert_eq!(previous.as_deref().map(String::as_str), Some("v1"));
  assert_eq!(second.value().as_str(), "v2");
  assert_eq!(second.version().unwrap().counter(), first.version().unwrap().counter() + 1);
}

#[test]
fn test_conditional_writes() {
  let cluster = TestCluster::start(3, 2);
  let node = cluster.node(2);
  let k = "cond".to_string();

  assert_eq!(node.replace(k.clone(), "ignored".into()).unwrap(), None);
  assert!(!node.contains_key(&k).unwrap());

  assert_eq!(node.put_if_absent(k.clone(), "first".into()).unwrap(), None);
  let existing = node.put_if_absent(k.clone(), "second".into()).unwrap();
  assert_eq!(existing.as_deref().map(String::as_str), Some("first"));

  let replaced = node.replace(k.clone(), "third".into()).unwrap();
  assert_eq!(replaced.as_deref().map(String::as_str), Some("first"));
  assert_eq!(cluster.node(0).get(&k).unwrap().as_deref().map(String::as_str), Some("third"));
}

#[test]
fn test_remove_clears_every_replica() {
  let cluster = TestCluster::start(3, 2);
  cluster.fill(10);

  let removed = cluster.node(1).remove(&key(3)).unwrap();
  assert_eq!(removed.as_deref(), Some(&value(3)));
  assert_eq!(cluster.copies_of(&key(3)), 0);
  for node in &cluster.nodes {
    assert_eq!(node.get(&key(3)).unwrap(), None);
  }
  assert_eq!(cluster.node(0).remove(&key(3)).unwrap(), None);
}

#[test]
fn test_read_metrics() {
  let cluster = TestCluster::start(2, 1);
  let node = cluster.node(0);

  node.put("present".into(), "yes".into()).unwrap();
  node.get(&"present".to_string()).unwrap();
  node.get(&"present".to_string()).unwrap();
  node.get(&"absent".to_string()).unwrap();

  let metrics = node.metrics();
  assert_eq!(metrics.hits, 2);
  assert_eq!(metrics.misses, 1);
  assert!((metrics.hit_ratio - 2.0 / 3.0).abs() < f64::EPSILON);
}

#[test]
fn test_stopped_node_rejects_operations() {
  let mut cluster = TestCluster::start(2, 2);
  let node = cluster.nodes.remove(1);
  node.stop().unwrap();

  assert!(node.is_stopped());
  assert!(node.put("k".into(), "v".into()).is_err());
  assert!(node.get(&"k".to_string()).is_err());
  assert_eq!(cluster.node(0).members().len(), 1);
}
