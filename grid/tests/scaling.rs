mod common;

use common::{key, value, TestCluster, SEGMENTS};
use fibre_grid::Address;

const KEYS: usize = 100;

fn assert_all_readable(cluster: &TestCluster) {
  for node in &cluster.nodes {
    for i in 0..KEYS {
      assert_eq!(
        node.get(&key(i)).unwrap().as_deref(),
        Some(&value(i)),
        "{} missing on {}",
        key(i),
        node.address()
      );
    }
  }
}

#[test]
fn test_scale_up_moves_state_to_joiners() {
  let mut cluster = TestCluster::start(1, 2);
  cluster.fill(KEYS);

  for expected in 2..=4 {
    cluster.add_node();
    assert_eq!(cluster.node(0).members().len(), expected);
    for i in 0..KEYS {
      assert_eq!(cluster.copies_of(&key(i)), 2, "copies of {} with {} nodes", key(i), expected);
    }
  }
  assert_all_readable(&cluster);

  let joiner = cluster.node(3);
  assert!(joiner.data_container().size() > 0);
  assert!(joiner.metrics().state_transfer_entries > 0);
  let owned = joiner.topology().unwrap().read_ch().segments_for_owner(joiner.address()).len();
  assert_eq!(owned, SEGMENTS as usize * 2 / 4);
}

#[test]
fn test_scale_down_to_one_node_keeps_every_key() {
  let mut cluster = TestCluster::start(6, 2);
  cluster.fill(KEYS);

  while cluster.nodes.len() > 1 {
    // Alternate between the coordinator and the youngest member.
    let index = if cluster.nodes.len() % 2 == 0 { 0 } else { cluster.nodes.len() - 1 };
    cluster.stop_node(index);

    let remaining = cluster.nodes.len();
    assert_eq!(cluster.node(0).members().len(), remaining);
    for i in 0..KEYS {
      assert_eq!(cluster.copies_of(&key(i)), remaining.min(2), "copies of {}", key(i));
    }
    assert_all_readable(&cluster);
  }

  let last = cluster.node(0);
  assert_eq!(last.data_container().size(), KEYS);
  assert!(last.resiliency_reports().is_empty(), "graceful leaves lose nothing");
}

#[test]
fn test_single_crash_with_backups_loses_nothing() {
  let mut cluster = TestCluster::start(3, 2);
  cluster.fill(KEYS);

  cluster.crash_node(2);

  assert_eq!(cluster.node(0).members().len(), 2);
  assert_all_readable(&cluster);
  for i in 0..KEYS {
    assert_eq!(cluster.copies_of(&key(i)), 2);
  }

  let reports = cluster.node(0).resiliency_reports();
  assert_eq!(reports.len(), 1);
  assert_eq!(reports[0].leavers, vec![Address::new("node-2")]);
  assert!(!reports[0].is_data_lost());
  assert_eq!(cluster.node(0).metrics().segments_lost, 0);
}

#[test]
fn test_crash_without_backups_reports_loss() {
  let mut cluster = TestCluster::start(3, 1);
  cluster.fill(KEYS);
  let crashed = Address::new("node-1");
  let topology = cluster.node(0).topology().unwrap();
  let owned_by_crashed = topology.read_ch().segments_for_owner(&crashed);
  let doomed: Vec<usize> = (0..KEYS)
    .filter(|i| owned_by_crashed.contains(&cluster.node(0).distribution().get_segment(&key(*i))))
    .collect();

  cluster.crash_node(1);

  let reports = cluster.node(0).resiliency_reports();
  assert_eq!(reports.len(), 1);
  let report = &reports[0];
  assert!(report.is_data_lost());
  assert_eq!(report.topology_id, topology.topology_id() + 1);
  assert_eq!(report.leavers, vec![crashed]);
  assert_eq!(report.lost_segments.len(), owned_by_crashed.len());
  let expected_fraction = owned_by_crashed.len() as f64 / SEGMENTS as f64;
  assert!((report.estimated_loss_fraction - expected_fraction).abs() < 1e-9);

  let metrics = cluster.node(0).metrics();
  assert_eq!(metrics.segments_lost, owned_by_crashed.len() as u64);
  assert!((metrics.last_loss_fraction - expected_fraction).abs() < 1e-9);

  // Lost keys are gone, everything else survived, and the cluster stays writable.
  for i in 0..KEYS {
    let found = cluster.node(0).get(&key(i)).unwrap();
    if doomed.contains(&i) {
      assert_eq!(found, None);
      cluster.node(1).put(key(i), value(i)).unwrap();
    } else {
      assert_eq!(found.as_deref(), Some(&value(i)));
    }
  }
  assert_all_readable(&cluster);
}

#[test]
fn test_coordinator_crash_is_handled_by_the_next_member() {
  let mut cluster = TestCluster::start(3, 2);
  cluster.fill(KEYS);

  cluster.crash_node(0);

  assert_eq!(cluster.node(0).address(), &Address::new("node-1"));
  assert_eq!(cluster.node(0).members().len(), 2);
  assert_eq!(cluster.node(0).resiliency_reports().len(), 1);
  assert_all_readable(&cluster);
}
