#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fibre_grid::{CacheEvent, CacheListener, GridBuilder, GridCache, LocalNetwork};
use parking_lot::Mutex;

pub const SEGMENTS: u32 = 32;

pub type Node = GridCache<String, String>;

/// Routes `tracing` output through the test harness. `RUST_LOG=fibre_grid=debug`
/// shows the topology flows.
pub fn init_logging() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

pub fn key(i: usize) -> String {
  format!("key-{}", i)
}

pub fn value(i: usize) -> String {
  format!("value-{}", i)
}

// Short timeouts keep failing tests fast; the reaper stays off so expiry is
// only observed when a test drives it.
pub fn node_builder(name: &str, network: &LocalNetwork<String, String>, num_owners: usize) -> GridBuilder<String, String> {
  GridBuilder::new(name)
    .network(network)
    .num_owners(num_owners)
    .num_segments(SEGMENTS)
    .remote_timeout(Duration::from_secs(5))
    .lock_acquisition_timeout(Duration::from_millis(200))
    .reaper_interval(None)
}

/// A set of nodes sharing one in-process network.
pub struct TestCluster {
  pub network: LocalNetwork<String, String>,
  pub nodes: Vec<Node>,
  num_owners: usize,
}

impl TestCluster {
  /// Starts `size` nodes named `node-0`, `node-1`, ... one after the other.
  pub fn start(size: usize, num_owners: usize) -> Self {
    init_logging();
    let mut cluster = Self {
      network: LocalNetwork::new(),
      nodes: Vec::new(),
      num_owners,
    };
    for _ in 0..size {
      cluster.add_node();
    }
    cluster
  }

  pub fn add_node(&mut self) -> &Node {
    let name = format!("node-{}", self.nodes.len());
    let node = node_builder(&name, &self.network, self.num_owners)
      .build()
      .unwrap();
    self.nodes.push(node);
    self.nodes.last().unwrap()
  }

  pub fn node(&self, index: usize) -> &Node {
    &self.nodes[index]
  }

  /// Stops the node gracefully and removes it from the cluster.
  pub fn stop_node(&mut self, index: usize) {
    let node = self.nodes.remove(index);
    node.stop().unwrap();
  }

  /// Disconnects the node without handing over its data.
  pub fn crash_node(&mut self, index: usize) {
    let node = self.nodes.remove(index);
    self.network.disconnect(node.address());
    drop(node);
  }

  pub fn fill(&self, count: usize) {
    for i in 0..count {
      self.nodes[0].put(key(i), value(i)).unwrap();
    }
  }

  /// How many nodes hold `key` in memory.
  pub fn copies_of(&self, key: &String) -> usize {
    self
      .nodes
      .iter()
      .filter(|n| n.data_container().peek(key).is_some())
      .count()
  }
}

/// Records every event as a short string.
#[derive(Default)]
pub struct EventLog {
  events: Mutex<Vec<String>>,
}

impl EventLog {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn events(&self) -> Vec<String> {
    self.events.lock().clone()
  }

  pub fn clear(&self) {
    self.events.lock().clear();
  }
}

impl CacheListener<String, String> for EventLog {
  fn on_event(&self, event: &CacheEvent<String, String>) {
    let line = match event {
      CacheEvent::Modified {
        key,
        previous,
        value,
        pre,
      } => format!(
        "{} modified {} {:?} -> {}",
        phase(*pre),
        key,
        previous.as_deref(),
        value
      ),
      CacheEvent::Removed { key, previous, pre } => {
        format!("{} removed {} {:?}", phase(*pre), key, previous.as_deref())
      }
      CacheEvent::Expired { key, value } => format!("expired {} {}", key, value),
      CacheEvent::Evicted { key, value } => format!("evicted {} {}", key, value),
      CacheEvent::TopologyChanged {
        topology_id, pre, ..
      } => format!("{} topology {}", phase(*pre), topology_id),
    };
    self.events.lock().push(line);
  }
}

fn phase(pre: bool) -> &'static str {
  if pre {
    "pre"
  } else {
    "post"
  }
}
