use crate::distribution::{CacheTopology, DistributionInfo, KeyPartitioner};
use crate::error::{GridError, Result};
use crate::remoting::Address;

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// Answers "where does this key live" against the installed topology.
///
/// The topology is swapped as a whole; callers take one snapshot per operation
/// through `current_topology` and never hold on to it across a remote call.
pub struct DistributionManager {
  local: Address,
  partitioner: KeyPartitioner,
  num_owners: usize,
  topology: RwLock<Option<Arc<CacheTopology>>>,
}

impl fmt::Debug for DistributionManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DistributionManager")
      .field("node", &self.local)
      .field("num_segments", &self.partitioner.num_segments())
      .field("topology_id", &self.topology_id())
      .finish()
  }
}

impl DistributionManager {
  pub fn new(local: Address, num_owners: usize, num_segments: u32) -> Self {
    Self {
      local,
      partitioner: KeyPartitioner::new(num_segments),
      num_owners,
      topology: RwLock::new(None),
    }
  }

  #[inline]
  pub fn local_address(&self) -> &Address {
    &self.local
  }

  #[inline]
  pub fn partitioner(&self) -> &KeyPartitioner {
    &self.partitioner
  }

  #[inline]
  pub fn num_owners(&self) -> usize {
    self.num_owners
  }

  #[inline]
  pub fn num_segments(&self) -> u32 {
    self.partitioner.num_segments()
  }

  #[inline]
  pub fn get_segment<K: Hash + ?Sized>(&self, key: &K) -> u32 {
    self.partitioner.segment(key)
  }

  /// The installed topology snapshot.
  pub fn current_topology(&self) -> Result<Arc<CacheTopology>> {
    self
      .topology
      .read()
      .clone()
      .ok_or_else(|| GridError::IllegalState(format!("node {} has no topology installed", self.local)))
  }

  pub fn try_current_topology(&self) -> Option<Arc<CacheTopology>> {
    self.topology.read().clone()
  }

  /// The id of the installed topology, 0 before the first one.
  pub fn topology_id(&self) -> u32 {
    self
      .topology
      .read()
      .as_ref()
      .map_or(0, |t| t.topology_id())
  }

  /// Installs `topology` unless an equal or newer one is already installed.
  /// Returns whether it was installed.
  pub(crate) fn set_topology(&self, topology: CacheTopology) -> bool {
    let mut slot = self.topology.write();
    if let Some(existing) = slot.as_ref() {
      if existing.topology_id() >= topology.topology_id() {
        return false;
      }
    }
    debug!(
      node = %self.local,
      topology_id = topology.topology_id(),
      phase = ?topology.phase(),
      members = ?topology.members(),
      "installed topology"
    );
    *slot = Some(Arc::new(topology));
    true
  }

  pub fn is_rehash_in_progress(&self) -> bool {
    self
      .topology
      .read()
      .as_ref()
      .is_some_and(|t| t.is_rebalance_in_progress())
  }

  pub fn locate_primary_owner<K: Hash + ?Sized>(&self, key: &K) -> Result<Address> {
    let segment = self.get_segment(key);
    self
      .current_topology()?
      .read_ch()
      .locate_primary_owner(segment)
      .cloned()
      .ok_or_else(|| GridError::IllegalState(format!("segment {} has no owners", segment)))
  }

  /// Read owners of `key`, primary first.
  pub fn locate_owners<K: Hash + ?Sized>(&self, key: &K) -> Result<Vec<Address>> {
    let segment = self.get_segment(key);
    Ok(self.current_topology()?.read_ch().locate_owners(segment).to_vec())
  }

  pub fn distribution<K: Hash + ?Sized>(&self, key: &K) -> Result<DistributionInfo> {
    let segment = self.get_segment(key);
    Ok(self.current_topology()?.distribution(segment))
  }
}
