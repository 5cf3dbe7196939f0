use crate::conflict::policy::EntryMergePolicy;
use crate::conflict::request::RequestCoalescer;
use crate::container::{CacheEntry, DataContainer};
use crate::distribution::DistributionManager;
use crate::error::{GridError, Result, TransportError};
use crate::invocation::Invoker;
use crate::metrics::Metrics;
use crate::remoting::{Address, Command, Transport, WriteOp};

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use tracing::{debug, info, warn};

/// The replicas of one key as reported by its write owners, in owner order.
/// Owners that could not be reached are missing; `None` means the owner has no
/// entry for the key.
pub type Versions<K, V> = Vec<(Address, Option<CacheEntry<K, V>>)>;

/// The replicas of one key gathered from all of its write owners.
pub struct ConflictRecord<K, V> {
  key: K,
  segment: u32,
  versions: Versions<K, V>,
}

impl<K: Clone, V> Clone for ConflictRecord<K, V> {
  fn clone(&self) -> Self {
    Self {
      key: self.key.clone(),
      segment: self.segment,
      versions: self.versions.clone(),
    }
  }
}

impl<K: fmt::Debug, V> fmt::Debug for ConflictRecord<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let replicas: Vec<_> = self
      .versions
      .iter()
      .map(|(address, entry)| (address, entry.as_ref().and_then(|e| e.version())))
      .collect();
    f.debug_struct("ConflictRecord")
      .field("key", &self.key)
      .field("segment", &self.segment)
      .field("replicas", &replicas)
      .finish()
  }
}

impl<K, V> ConflictRecord<K, V> {
  pub fn key(&self) -> &K {
    &self.key
  }

  pub fn segment(&self) -> u32 {
    self.segment
  }

  pub fn versions(&self) -> &Versions<K, V> {
    &self.versions
  }

  pub fn get(&self, owner: &Address) -> Option<&Option<CacheEntry<K, V>>> {
    self.versions.iter().find(|(a, _)| a == owner).map(|(_, e)| e)
  }

  /// `true` if any two replicas differ in presence or version.
  pub fn is_conflicting(&self) -> bool {
    let mut replicas = self
      .versions
      .iter()
      .map(|(_, entry)| entry.as_ref().map(|e| e.version()));
    match replicas.next() {
      Some(first) => replicas.any(|other| other != first),
      None => false,
    }
  }
}

/// Counts of one `resolve_conflicts` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionSummary {
  pub conflicts: usize,
  pub written: usize,
  pub removed: usize,
}

/// Where the conflict manager is in its `IDLE -> COLLECTING -> RESOLVING` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictState {
  Idle,
  Collecting,
  Resolving,
}

struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for FlagGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Detects and resolves divergent replicas after a partition merge.
pub struct ConflictManager<K, V> {
  local: Address,
  transport: Arc<dyn Transport<K, V>>,
  distribution: Arc<DistributionManager>,
  container: Arc<DataContainer<K, V>>,
  invoker: Arc<Invoker<K, V>>,
  default_policy: Option<Arc<dyn EntryMergePolicy<K, V>>>,
  metrics: Arc<Metrics>,
  timeout: Duration,
  requests: RequestCoalescer<K, Result<Versions<K, V>>>,
  collecting: AtomicBool,
  resolving: AtomicBool,
}

impl<K, V> fmt::Debug for ConflictManager<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConflictManager")
      .field("node", &self.local)
      .field("state", &self.state())
      .field("default_policy", &self.default_policy.is_some())
      .finish()
  }
}

impl<K, V> ConflictManager<K, V> {
  pub fn state(&self) -> ConflictState {
    if self.resolving.load(Ordering::Acquire) {
      ConflictState::Resolving
    } else if self.collecting.load(Ordering::Acquire) {
      ConflictState::Collecting
    } else {
      ConflictState::Idle
    }
  }

  pub fn is_conflict_resolution_in_progress(&self) -> bool {
    self.resolving.load(Ordering::Acquire)
  }

  pub fn is_state_transfer_in_progress(&self) -> bool {
    self.distribution.is_rehash_in_progress()
  }
}

impl<K, V> ConflictManager<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub(crate) fn new(
    transport: Arc<dyn Transport<K, V>>,
    distribution: Arc<DistributionManager>,
    container: Arc<DataContainer<K, V>>,
    invoker: Arc<Invoker<K, V>>,
    default_policy: Option<Arc<dyn EntryMergePolicy<K, V>>>,
    metrics: Arc<Metrics>,
    timeout: Duration,
  ) -> Self {
    Self {
      local: distribution.local_address().clone(),
      transport,
      distribution,
      container,
      invoker,
      default_policy,
      metrics,
      timeout,
      requests: RequestCoalescer::new(),
      collecting: AtomicBool::new(false),
      resolving: AtomicBool::new(false),
    }
  }

  pub(crate) fn default_policy(&self) -> Option<&Arc<dyn EntryMergePolicy<K, V>>> {
    self.default_policy.as_ref()
  }

  /// The replica of `key` on every current write owner, queried in parallel.
  /// Concurrent calls for the same key share one collection.
  pub fn get_all_versions(&self, key: &K) -> Result<Versions<K, V>> {
    self.requests.get_or_fetch(key, || self.collect_versions(key))
  }

  fn collect_versions(&self, key: &K) -> Result<Versions<K, V>> {
    let topology = self.distribution.current_topology()?;
    if topology.is_rebalance_in_progress() {
      return Err(GridError::ClusterState(format!(
        "cannot collect versions of {:?} while topology {} is rebalancing",
        key,
        topology.topology_id()
      )));
    }
    let owners = topology
      .distribution(self.distribution.get_segment(key))
      .write_owners;

    let replies: Vec<(Address, Result<Option<CacheEntry<K, V>>>)> = owners
      .par_iter()
      .map(|owner| (owner.clone(), self.fetch_replica(owner, key)))
      .collect();

    let mut versions = Vec::with_capacity(replies.len());
    for (owner, reply) in replies {
      match reply {
        Ok(entry) => versions.push((owner, entry)),
        Err(GridError::Transport(e)) => {
          debug!(node = %self.local, %owner, ?key, error = %e, "owner did not report its replica");
        }
        Err(e) => return Err(e),
      }
    }

    if self.distribution.topology_id() != topology.topology_id() {
      return Err(GridError::ClusterState(format!(
        "topology changed from {} while collecting versions of {:?}",
        topology.topology_id(),
        key
      )));
    }
    Ok(versions)
  }

  fn fetch_replica(&self, owner: &Address, key: &K) -> Result<Option<CacheEntry<K, V>>> {
    if owner == &self.local {
      return self.container.get(key);
    }
    let response = self
      .transport
      .send(owner, Command::GetEntry { key: key.clone() }, self.timeout)?;
    Ok(response.into_entry())
  }

  /// Keys any write owner of `segment` holds.
  fn segment_keys(&self, segment: u32) -> Result<Vec<K>> {
    let topology = self.distribution.current_topology()?;
    let mut seen: HashSet<K, ahash::RandomState> = HashSet::default();
    let mut keys = Vec::new();
    for owner in topology.write_ch().locate_owners(segment) {
      let entries = if owner == &self.local {
        self.container.entries_for_segments(&[segment].into_iter().collect())
      } else {
        let command = Command::GetSegments {
          segments: vec![segment],
          topology_id: topology.topology_id(),
        };
        match self.transport.send(owner, command, self.timeout) {
          Ok(response) => response.into_entries(),
          Err(TransportError::Remote(e)) => return Err(*e),
          Err(e) => {
            debug!(node = %self.local, %owner, segment, error = %e, "owner did not list its keys");
            continue;
          }
        }
      };
      for entry in entries {
        if seen.insert(entry.key().clone()) {
          keys.push(entry.key().clone());
        }
      }
    }
    Ok(keys)
  }

  /// Lazily scans the segments this node owns and yields the conflicting keys.
  ///
  /// The scan fails with `ClusterState` as soon as the topology changes or a
  /// rebalance starts; it is not restarted. Only one scan may run at a time.
  pub fn get_conflicts(&self) -> Result<ConflictIter<'_, K, V>> {
    let flag = FlagGuard::acquire(&self.collecting)
      .ok_or_else(|| GridError::IllegalState("a conflict scan is already running".into()))?;
    let topology = self.distribution.current_topology()?;
    let segments = topology.write_ch().segments_for_owner(&self.local);
    self.scan(segments.into_iter().collect(), Some(flag))
  }

  fn scan<'a>(&'a self, segments: VecDeque<u32>, flag: Option<FlagGuard<'a>>) -> Result<ConflictIter<'a, K, V>> {
    let topology = self.distribution.current_topology()?;
    if topology.is_rebalance_in_progress() {
      return Err(GridError::ClusterState(format!(
        "topology {} is rebalancing",
        topology.topology_id()
      )));
    }
    Ok(ConflictIter {
      manager: self,
      topology_id: topology.topology_id(),
      segments,
      segment: 0,
      keys: VecDeque::new(),
      finished: false,
      _flag: flag,
    })
  }

  /// Resolves every conflict in the cluster with the configured merge policy,
  /// preferring the primary owner's replica.
  pub fn resolve_conflicts(&self) -> Result<ResolutionSummary> {
    let policy = self
      .default_policy
      .clone()
      .ok_or_else(|| GridError::IllegalState("no merge policy is configured".into()))?;
    self.resolve_conflicts_with(policy.as_ref())
  }

  pub fn resolve_conflicts_with(&self, policy: &dyn EntryMergePolicy<K, V>) -> Result<ResolutionSummary> {
    let segments = (0..self.distribution.num_segments()).collect();
    self.resolve(policy, segments, &[])
  }

  /// Resolves the conflicts of the segments this node is primary for, preferring
  /// replicas held by `preferred` members. Run on every member after a merge.
  pub(crate) fn resolve_after_merge(
    &self,
    policy: &dyn EntryMergePolicy<K, V>,
    preferred: &[Address],
  ) -> Result<ResolutionSummary> {
    let topology = self.distribution.current_topology()?;
    let segments = topology.read_ch().primary_segments_for_owner(&self.local);
    self.resolve(policy, segments.into_iter().collect(), preferred)
  }

  fn resolve(
    &self,
    policy: &dyn EntryMergePolicy<K, V>,
    segments: VecDeque<u32>,
    preferred: &[Address],
  ) -> Result<ResolutionSummary> {
    let _resolving = FlagGuard::acquire(&self.resolving)
      .ok_or_else(|| GridError::IllegalState("conflict resolution is already in progress".into()))?;
    let mut summary = ResolutionSummary::default();
    let mut ctx = self.invoker.invocation_context();

    for record in self.scan(segments, None)? {
      let record = record?;
      summary.conflicts += 1;
      let (winner_index, winner) = preferred_replica(&record, preferred);
      let others: Vec<CacheEntry<K, V>> = record
        .versions
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != winner_index)
        .filter_map(|(_, (_, entry))| entry.clone())
        .collect();

      let op = match policy.merge(winner, others) {
        Some(entry) => {
          summary.written += 1;
          WriteOp::Put {
            value: entry.value().clone(),
            metadata: entry.metadata().without_version(),
          }
        }
        None => {
          summary.removed += 1;
          WriteOp::Remove
        }
      };
      debug!(node = %self.local, key = ?record.key, op = op.name(), "resolving conflict");
      self.invoker.write(&mut ctx, record.key, op)?;
      Metrics::incr(&self.metrics.conflicts_resolved);
    }

    if summary.conflicts > 0 {
      info!(
        node = %self.local,
        conflicts = summary.conflicts,
        written = summary.written,
        removed = summary.removed,
        "resolved conflicts"
      );
    }
    Ok(summary)
  }
}

/// The replica the merge policy prefers: the first one held by a preferred
/// member, or the first reported one (the primary owner's) otherwise.
fn preferred_replica<K: Clone, V>(
  record: &ConflictRecord<K, V>,
  preferred: &[Address],
) -> (Option<usize>, Option<CacheEntry<K, V>>) {
  let index = record
    .versions
    .iter()
    .position(|(owner, _)| preferred.contains(owner))
    .or(if record.versions.is_empty() { None } else { Some(0) });
  let entry = index.and_then(|i| record.versions[i].1.clone());
  (index, entry)
}

/// Lazy sequence of conflicting keys, one segment at a time.
pub struct ConflictIter<'a, K, V> {
  manager: &'a ConflictManager<K, V>,
  topology_id: u32,
  segments: VecDeque<u32>,
  segment: u32,
  keys: VecDeque<K>,
  finished: bool,
  // Released when the scan finishes or the iterator is dropped.
  _flag: Option<FlagGuard<'a>>,
}

impl<K, V> ConflictIter<'_, K, V> {
  fn finish(&mut self) {
    self.finished = true;
    self._flag = None;
  }
}

impl<K, V> Iterator for ConflictIter<'_, K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  type Item = Result<ConflictRecord<K, V>>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if self.finished {
        return None;
      }
      let distribution = &self.manager.distribution;
      if distribution.topology_id() != self.topology_id || distribution.is_rehash_in_progress() {
        warn!(
          node = %self.manager.local,
          started_at = self.topology_id,
          now = distribution.topology_id(),
          "topology changed during conflict scan"
        );
        self.finish();
        return Some(Err(GridError::ClusterState(format!(
          "topology changed from {} during the conflict scan",
          self.topology_id
        ))));
      }

      if let Some(key) = self.keys.pop_front() {
        match self.manager.get_all_versions(&key) {
          Ok(versions) => {
            let record = ConflictRecord {
              key,
              segment: self.segment,
              versions,
            };
            if record.is_conflicting() {
              Metrics::incr(&self.manager.metrics.conflicts_detected);
              return Some(Ok(record));
            }
          }
          Err(e) => {
            self.finish();
            return Some(Err(e));
          }
        }
        continue;
      }

      let Some(segment) = self.segments.pop_front() else {
        self.finish();
        return None;
      };
      self.segment = segment;
      match self.manager.segment_keys(segment) {
        Ok(keys) => self.keys = keys.into(),
        Err(e) => {
          self.finish();
          return Some(Err(e));
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::container::{EntryVersion, Metadata};

  fn replica(owner: &str, version: Option<(u32, u64, &str)>) -> (Address, Option<CacheEntry<String, u32>>) {
    let entry = version.map(|(topology, counter, origin)| {
      CacheEntry::new(
        "k".to_string(),
        Arc::new(counter as u32),
        Metadata::new().with_version(EntryVersion::new(topology, counter, Address::new(origin))),
        0,
      )
    });
    (Address::new(owner), entry)
  }

  fn record(versions: Versions<String, u32>) -> ConflictRecord<String, u32> {
    ConflictRecord {
      key: "k".to_string(),
      segment: 0,
      versions,
    }
  }

  #[test]
  fn identical_replicas_do_not_conflict() {
    let r = record(vec![
      replica("a", Some((2, 1, "a"))),
      replica("b", Some((2, 1, "a"))),
    ]);
    assert!(!r.is_conflicting());
    assert!(!record(vec![replica("a", None), replica("b", None)]).is_conflicting());
    assert!(!record(vec![]).is_conflicting());
  }

  #[test]
  fn presence_or_version_differences_conflict() {
    assert!(record(vec![replica("a", Some((2, 1, "a"))), replica("b", None)]).is_conflicting());
    assert!(record(vec![
      replica("a", Some((2, 1, "a"))),
      replica("b", Some((2, 1, "c"))),
    ])
    .is_conflicting());
  }

  #[test]
  fn preferred_members_win_over_the_first_replica() {
    let r = record(vec![
      replica("c", Some((3, 4, "c"))),
      replica("a", Some((3, 1, "a"))),
      replica("b", Some((3, 1, "a"))),
    ]);
    let (index, entry) = preferred_replica(&r, &[Address::new("a"), Address::new("b")]);
    assert_eq!(index, Some(1));
    assert_eq!(**entry.unwrap().value(), 1);

    let (index, entry) = preferred_replica(&r, &[]);
    assert_eq!(index, Some(0));
    assert_eq!(**entry.unwrap().value(), 4);
  }
}
