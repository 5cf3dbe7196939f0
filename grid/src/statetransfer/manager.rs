use crate::distribution::{CacheTopology, DistributionManager};
use crate::error::Result;
use crate::lock::LockManager;
use crate::metrics::Metrics;
use crate::notifications::{CacheEvent, ListenerRegistry};
use crate::remoting::Address;
use crate::statetransfer::{StateConsumer, StateTransferLock, TransferSummary};

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

/// Installs topologies on the local node and drives the resulting data movement.
pub(crate) struct StateTransferManager<K, V> {
  local: Address,
  distribution: Arc<DistributionManager>,
  lock: Arc<StateTransferLock>,
  locks: Arc<LockManager<K>>,
  consumer: StateConsumer<K, V>,
  listeners: Arc<ListenerRegistry<K, V>>,
  metrics: Arc<Metrics>,
  // Serializes installations; state is consumed in topology order.
  installing: Mutex<()>,
}

impl<K, V> fmt::Debug for StateTransferManager<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StateTransferManager")
      .field("node", &self.local)
      .field("topology_id", &self.lock.topology_id())
      .finish()
  }
}

impl<K, V> StateTransferManager<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub(crate) fn new(
    local: Address,
    distribution: Arc<DistributionManager>,
    lock: Arc<StateTransferLock>,
    locks: Arc<LockManager<K>>,
    consumer: StateConsumer<K, V>,
    listeners: Arc<ListenerRegistry<K, V>>,
    metrics: Arc<Metrics>,
  ) -> Self {
    Self {
      local,
      distribution,
      lock,
      locks,
      consumer,
      listeners,
      metrics,
      installing: Mutex::new(()),
    }
  }

  pub(crate) fn lock(&self) -> &Arc<StateTransferLock> {
    &self.lock
  }

  /// Makes `topology` the node's current topology, then fetches or drops
  /// segments as the change requires. Topologies that are not newer than the
  /// installed one are ignored.
  pub(crate) fn install(&self, topology: CacheTopology) -> Result<Option<TransferSummary>> {
    let _serial = self.installing.lock();
    let previous = self.distribution.try_current_topology();
    let previous_id = previous.as_ref().map_or(0, |t| t.topology_id());
    let topology_id = topology.topology_id();
    if topology_id <= previous_id {
      debug!(node = %self.local, topology_id, installed = previous_id, "ignoring outdated topology");
      return Ok(None);
    }
    let members = topology.members().to_vec();

    self.listeners.notify_with(|| CacheEvent::TopologyChanged {
      previous_id,
      topology_id,
      members: members.clone(),
      pre: true,
    });
    {
      // Waits for every command running against the previous topology.
      let _exclusive = self.lock.acquire_exclusive();
      self.distribution.set_topology(topology.clone());
    }
    self.lock.notify_topology_installed(topology_id);
    if topology.is_rebalance_in_progress() {
      Metrics::incr(&self.metrics.rebalances);
    }
    info!(
      node = %self.local,
      topology_id,
      phase = ?topology.phase(),
      members = ?members,
      "installed topology"
    );

    if let Some(previous) = &previous {
      for departed in previous
        .write_ch()
        .members()
        .iter()
        .filter(|m| !topology.write_ch().members().contains(m))
      {
        self.locks.release_locks_of(departed);
      }
    }

    let summary = self.consumer.on_topology(previous.as_deref(), &topology)?;

    self.listeners.notify_with(|| CacheEvent::TopologyChanged {
      previous_id,
      topology_id,
      members,
      pre: false,
    });
    Ok(Some(summary))
  }
}
