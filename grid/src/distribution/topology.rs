use crate::distribution::ConsistentHash;
use crate::remoting::Address;

use std::fmt;
use std::sync::Arc;

/// The stage of a topology with respect to data movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyPhase {
  /// No data is moving. Reads and writes use the current hash.
  Stable,
  /// A rebalance is in flight: reads use the current hash, writes go to the
  /// owners of both the current and the pending hash.
  ReadOldWriteAll,
  /// Partitions just merged. The current hash is the union of the partitions'
  /// hashes so every replica that may hold a conflicting copy is an owner.
  ConflictResolution,
}

/// Whether a partition still holds an owner of every segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AvailabilityMode {
  #[default]
  Available,
  /// Every owner of some segment left the partition. Stays degraded until the
  /// partitions merge.
  Degraded,
}

/// A versioned snapshot of the distribution of one cache.
///
/// Topologies are immutable and shared through `Arc`; a change installs a new
/// instance with a higher `topology_id`.
#[derive(Clone)]
pub struct CacheTopology {
  topology_id: u32,
  current: Arc<ConsistentHash>,
  pending: Option<Arc<ConsistentHash>>,
  // current ∪ pending while rebalancing, otherwise the current hash.
  write: Arc<ConsistentHash>,
  phase: TopologyPhase,
  availability: AvailabilityMode,
}

impl fmt::Debug for CacheTopology {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheTopology")
      .field("topology_id", &self.topology_id)
      .field("phase", &self.phase)
      .field("availability", &self.availability)
      .field("members", &self.current.members())
      .field("pending_members", &self.pending.as_ref().map(|p| p.members()))
      .finish()
  }
}

impl CacheTopology {
  pub fn stable(topology_id: u32, current: ConsistentHash) -> Self {
    let current = Arc::new(current);
    Self {
      topology_id,
      write: current.clone(),
      current,
      pending: None,
      phase: TopologyPhase::Stable,
      availability: AvailabilityMode::Available,
    }
  }

  pub fn rebalancing(topology_id: u32, current: ConsistentHash, pending: ConsistentHash) -> Self {
    let write = Arc::new(current.union(&pending));
    Self {
      topology_id,
      current: Arc::new(current),
      pending: Some(Arc::new(pending)),
      write,
      phase: TopologyPhase::ReadOldWriteAll,
      availability: AvailabilityMode::Available,
    }
  }

  pub fn conflict_resolution(topology_id: u32, union: ConsistentHash) -> Self {
    let current = Arc::new(union);
    Self {
      topology_id,
      write: current.clone(),
      current,
      pending: None,
      phase: TopologyPhase::ConflictResolution,
      availability: AvailabilityMode::Available,
    }
  }

  pub fn with_availability(mut self, availability: AvailabilityMode) -> Self {
    self.availability = availability;
    self
  }

  #[inline]
  pub fn topology_id(&self) -> u32 {
    self.topology_id
  }

  #[inline]
  pub fn phase(&self) -> TopologyPhase {
    self.phase
  }

  #[inline]
  pub fn availability(&self) -> AvailabilityMode {
    self.availability
  }

  /// The hash reads are served from.
  #[inline]
  pub fn read_ch(&self) -> &ConsistentHash {
    &self.current
  }

  /// The hash writes are replicated by.
  #[inline]
  pub fn write_ch(&self) -> &ConsistentHash {
    &self.write
  }

  #[inline]
  pub fn current_ch(&self) -> &ConsistentHash {
    &self.current
  }

  #[inline]
  pub fn pending_ch(&self) -> Option<&ConsistentHash> {
    self.pending.as_deref()
  }

  /// The members of the hash that will be in effect once data stops moving.
  pub fn members(&self) -> &[Address] {
    self
      .pending
      .as_deref()
      .unwrap_or(&self.current)
      .members()
  }

  pub fn is_rebalance_in_progress(&self) -> bool {
    self.pending.is_some()
  }

  pub fn distribution(&self, segment: u32) -> DistributionInfo {
    let read_owners = self.current.locate_owners(segment).to_vec();
    let write_owners = self.write.locate_owners(segment).to_vec();
    DistributionInfo {
      segment,
      primary: read_owners.first().cloned(),
      read_owners,
      write_owners,
    }
  }
}

/// Where one segment lives in a given topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionInfo {
  pub segment: u32,
  /// Locks and orders writes for the segment's keys.
  pub primary: Option<Address>,
  pub read_owners: Vec<Address>,
  /// Read owners first, then owners that only receive writes while a rebalance
  /// is in flight.
  pub write_owners: Vec<Address>,
}

impl DistributionInfo {
  pub fn is_primary(&self, address: &Address) -> bool {
    self.primary.as_ref() == Some(address)
  }

  pub fn is_read_owner(&self, address: &Address) -> bool {
    self.read_owners.contains(address)
  }

  pub fn is_write_owner(&self, address: &Address) -> bool {
    self.write_owners.contains(address)
  }
}
