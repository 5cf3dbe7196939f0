use crate::cluster::ResiliencyReport;
use crate::component::Lifecycle;
use crate::conflict::ConflictManager;
use crate::config::PartitionHandling;
use crate::distribution::{AvailabilityMode, CacheTopology, ConsistentHash, ConsistentHashFactory, DistributionManager};
use crate::error::{GridError, Result, TransportError};
use crate::metrics::Metrics;
use crate::remoting::{Address, Command, InboundHandler, Response, Transport, View};
use crate::statetransfer::StateTransferManager;

use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// One side of a split as seen by the merge coordinator.
#[derive(Debug, Clone)]
pub(crate) struct Partition {
  pub(crate) members: Vec<Address>,
  pub(crate) topology: CacheTopology,
}

/// Turns membership changes into topologies.
///
/// Every node runs one, but only the first member of a view acts on it: it
/// computes the next consistent hash, installs it locally and pushes it to the
/// other members. A topology change always goes through a `ReadOldWriteAll`
/// topology, during which the new owners pull their segments, before the
/// stable one is installed.
///
/// Unless `when_split` is `ALLOW_READ_WRITES`, a membership change that takes
/// away every owner of some segment marks the topologies of the remaining
/// members `Degraded`. They stay degraded until the partitions merge.
pub struct ClusterTopologyManager<K, V> {
  local: Address,
  transport: Arc<dyn Transport<K, V>>,
  distribution: Arc<DistributionManager>,
  state_transfer: Arc<StateTransferManager<K, V>>,
  conflicts: Arc<ConflictManager<K, V>>,
  factory: ConsistentHashFactory,
  metrics: Arc<Metrics>,
  timeout: Duration,
  when_split: PartitionHandling,
  handler: OnceCell<Weak<dyn InboundHandler<K, V>>>,
  // Serializes the coordinator flows of this node.
  coordinating: Mutex<()>,
  reports: Mutex<Vec<ResiliencyReport>>,
  joined: AtomicBool,
  leaving: AtomicBool,
}

impl<K, V> fmt::Debug for ClusterTopologyManager<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ClusterTopologyManager")
      .field("node", &self.local)
      .field("topology_id", &self.distribution.topology_id())
      .field("joined", &self.joined.load(Ordering::Relaxed))
      .field("when_split", &self.when_split)
      .finish()
  }
}

impl<K, V> ClusterTopologyManager<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub(crate) fn new(
    transport: Arc<dyn Transport<K, V>>,
    distribution: Arc<DistributionManager>,
    state_transfer: Arc<StateTransferManager<K, V>>,
    conflicts: Arc<ConflictManager<K, V>>,
    metrics: Arc<Metrics>,
    timeout: Duration,
    when_split: PartitionHandling,
  ) -> Self {
    Self {
      local: distribution.local_address().clone(),
      transport,
      distribution,
      state_transfer,
      conflicts,
      factory: ConsistentHashFactory,
      metrics,
      timeout,
      when_split,
      handler: OnceCell::new(),
      coordinating: Mutex::new(()),
      reports: Mutex::new(Vec::new()),
      joined: AtomicBool::new(false),
      leaving: AtomicBool::new(false),
    }
  }

  /// Sets the handler the transport delivers to. Must happen before `join`.
  pub(crate) fn set_handler(&self, handler: Weak<dyn InboundHandler<K, V>>) -> Result<()> {
    self
      .handler
      .set(handler)
      .map_err(|_| GridError::IllegalState("inbound handler already set".into()))
  }

  /// Joins the cluster. Returns once this node has a topology: the view change
  /// produced by the join is processed before the transport returns.
  pub(crate) fn join(&self) -> Result<()> {
    let handler = self
      .handler
      .get()
      .cloned()
      .ok_or_else(|| GridError::IllegalState("no inbound handler registered".into()))?;
    self.transport.start(handler)?;
    self.joined.store(true, Ordering::Release);
    if self.distribution.try_current_topology().is_none() {
      return Err(GridError::ClusterState(format!(
        "{} joined but received no topology",
        self.local
      )));
    }
    Ok(())
  }

  /// Leaves gracefully: the coordinator moves this node's segments to the
  /// remaining members before the node disconnects.
  pub(crate) fn leave(&self) -> Result<()> {
    if !self.joined.load(Ordering::Acquire) || self.leaving.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    let view = self.transport.current_view();
    let result = match view.coordinator() {
      Some(coordinator) if coordinator == &self.local => self.handle_leave(&self.local),
      Some(coordinator) => self
        .transport
        .send(
          coordinator,
          Command::Leave {
            leaver: self.local.clone(),
          },
          self.timeout,
        )
        .map(|_| ())
        .map_err(GridError::from),
      None => Ok(()),
    };
    if let Err(e) = &result {
      warn!(node = %self.local, error = %e, "graceful leave failed, disconnecting anyway");
    }
    self.transport.stop();
    self.joined.store(false, Ordering::Release);
    info!(node = %self.local, "left the cluster");
    result
  }

  pub fn is_coordinator(&self) -> bool {
    self.transport.current_view().coordinator() == Some(&self.local)
  }

  pub fn resiliency_reports(&self) -> Vec<ResiliencyReport> {
    self.reports.lock().clone()
  }

  /// Entry point for every view the transport delivers.
  pub(crate) fn on_view_change(&self, view: &View) {
    if self.leaving.load(Ordering::Acquire) || !view.contains(&self.local) {
      return;
    }
    if view.coordinator() != Some(&self.local) {
      debug!(node = %self.local, view_id = view.id, members = ?view.members, "view change");
      return;
    }
    let _coordinating = self.coordinating.lock();
    let result = if view.is_merge() {
      self.handle_merge(view)
    } else {
      self.handle_membership(view)
    };
    if let Err(e) = result {
      error!(node = %self.local, view_id = view.id, error = %e, "failed to process view change");
    }
  }

  fn handle_membership(&self, view: &View) -> Result<()> {
    let Some(topology) = self.distribution.try_current_topology() else {
      let ch = self.factory.create(
        self.distribution.num_owners(),
        self.distribution.num_segments(),
        &view.members,
      );
      info!(node = %self.local, members = ?view.members, "creating the initial topology");
      return self.publish(CacheTopology::stable(1, ch));
    };

    let before: BTreeSet<&Address> = topology.members().iter().collect();
    let after: BTreeSet<&Address> = view.members.iter().collect();
    if before == after {
      return Ok(());
    }
    let leavers: Vec<Address> = topology
      .members()
      .iter()
      .filter(|m| !after.contains(m))
      .cloned()
      .collect();
    let joiners = view.members.iter().any(|m| !before.contains(&m));
    let topology_id = topology.topology_id();

    let mut availability = topology.availability();
    let mut current = topology.current_ch().clone();
    if !leavers.is_empty() {
      let (stripped, lost) = self.factory.remove_leavers(&current, &view.members);
      if !lost.is_empty() && self.when_split != PartitionHandling::AllowReadWrites {
        if availability == AvailabilityMode::Available {
          warn!(
            node = %self.local,
            leavers = ?leavers,
            lost_segments = lost.len(),
            when_split = ?self.when_split,
            "partition lost every owner of some segments, entering degraded mode"
          );
        }
        availability = AvailabilityMode::Degraded;
      }
      // The rebalancing topology installed next is the first without the leavers.
      self.report_loss(topology_id + 1, leavers, topology.members().to_vec(), lost);
      current = stripped;
    }

    let mut pending = self.factory.update_members(&current, &view.members);
    if joiners {
      pending = self.factory.rebalance(&pending);
    }
    self.rebalance(topology_id, current, pending, availability)
  }

  /// Runs on the coordinator for a member that asked to leave.
  pub(crate) fn handle_leave(&self, leaver: &Address) -> Result<()> {
    let _coordinating = self.coordinating.lock();
    let topology = self.distribution.current_topology()?;
    if !topology.members().contains(leaver) {
      return Ok(());
    }
    let remaining: Vec<Address> = topology
      .members()
      .iter()
      .filter(|m| *m != leaver)
      .cloned()
      .collect();
    if remaining.is_empty() {
      info!(node = %self.local, "last member leaving, nothing to hand over");
      return Ok(());
    }
    info!(node = %self.local, %leaver, remaining = ?remaining, "moving state away from leaving member");
    let current = topology.current_ch().clone();
    let pending = self.factory.update_members(&current, &remaining);
    self.rebalance(topology.topology_id(), current, pending, topology.availability())
  }

  fn handle_merge(&self, view: &View) -> Result<()> {
    let partitions = self.collect_partitions(view);
    let Some(preferred) = preferred_partition(&partitions, &self.local) else {
      return self.handle_membership(view);
    };
    let max_id = partitions
      .iter()
      .map(|p| p.topology.topology_id())
      .max()
      .unwrap_or(0);
    info!(
      node = %self.local,
      partitions = partitions.len(),
      preferred = ?preferred.members,
      "merging partitions"
    );

    let union = partitions
      .iter()
      .filter(|p| p.members != preferred.members)
      .fold(preferred.topology.current_ch().clone(), |union, other| {
        self.factory.union(&union, other.topology.current_ch())
      });
    let topology_id = max_id + 1;
    if partitions.iter().any(|p| p.topology.availability() == AvailabilityMode::Degraded) {
      info!(node = %self.local, topology_id, "partitions merged, leaving degraded mode");
    }
    self.publish(CacheTopology::conflict_resolution(topology_id, union.clone()))?;

    if self.conflicts.default_policy().is_some() {
      self.resolve_conflicts_everywhere(topology_id, &preferred.members);
    } else {
      info!(node = %self.local, "no merge policy configured, conflicts left in place");
    }

    let pending = self
      .factory
      .rebalance(&self.factory.update_members(&union, &view.members));
    self.rebalance(topology_id, union, pending, AvailabilityMode::Available)
  }

  fn collect_partitions(&self, view: &View) -> Vec<Partition> {
    let mut statuses: Vec<(Address, Option<CacheTopology>)> = vec![(
      self.local.clone(),
      self.distribution.try_current_topology().map(|t| (*t).clone()),
    )];
    for (member, reply) in self.transport.broadcast(Command::Status, self.timeout) {
      match reply {
        Ok(Response::Status(topology)) => statuses.push((member, topology)),
        Ok(other) => warn!(node = %self.local, %member, reply = ?other, "unexpected status reply"),
        Err(e) => warn!(node = %self.local, %member, error = %e, "no status from member"),
      }
    }

    view
      .subgroups
      .iter()
      .filter_map(|group| {
        let topology = statuses
          .iter()
          .filter(|(member, _)| group.contains(member))
          .filter_map(|(_, topology)| topology.as_ref())
          .max_by_key(|t| t.topology_id())?
          .clone();
        Some(Partition {
          members: group.clone(),
          topology,
        })
      })
      .collect()
  }

  fn resolve_conflicts_everywhere(&self, topology_id: u32, preferred: &[Address]) {
    let command = Command::ResolveConflicts {
      topology_id,
      preferred: preferred.to_vec(),
    };
    for (member, reply) in self.transport.broadcast(command, self.timeout) {
      if let Err(e) = reply {
        warn!(node = %self.local, %member, error = %e, "conflict resolution failed on member");
      }
    }
    if let Err(e) = self.resolve_local_conflicts(topology_id, preferred) {
      warn!(node = %self.local, error = %e, "local conflict resolution failed");
    }
  }

  /// Resolves the conflicts of the segments this node is primary for, as
  /// requested by the merge coordinator.
  pub(crate) fn resolve_local_conflicts(&self, topology_id: u32, preferred: &[Address]) -> Result<()> {
    let installed = self.distribution.topology_id();
    if installed != topology_id {
      return Err(GridError::ClusterState(format!(
        "conflict resolution requested for topology {} but {} is installed",
        topology_id, installed
      )));
    }
    let Some(policy) = self.conflicts.default_policy().cloned() else {
      return Ok(());
    };
    self
      .conflicts
      .resolve_after_merge(policy.as_ref(), preferred)
      .map(|_| ())
  }

  /// Installs `ReadOldWriteAll(current, pending)` and then `Stable(pending)`.
  fn rebalance(
    &self,
    after: u32,
    current: ConsistentHash,
    pending: ConsistentHash,
    availability: AvailabilityMode,
  ) -> Result<()> {
    self.publish(CacheTopology::rebalancing(after + 1, current, pending.clone()).with_availability(availability))?;
    self.publish(CacheTopology::stable(after + 2, pending).with_availability(availability))
  }

  /// Installs `topology` here, then on every other member of the view. Each
  /// member has consumed its state by the time its install returns.
  fn publish(&self, topology: CacheTopology) -> Result<()> {
    let topology_id = topology.topology_id();
    self.state_transfer.install(topology.clone())?;
    for (member, reply) in self
      .transport
      .broadcast(Command::TopologyUpdate { topology }, self.timeout)
    {
      match reply {
        Ok(_) => {}
        Err(TransportError::Remote(e)) => {
          warn!(node = %self.local, %member, topology_id, error = %e, "member failed to install topology")
        }
        Err(e) => debug!(node = %self.local, %member, topology_id, error = %e, "member did not receive topology"),
      }
    }
    Ok(())
  }

  fn report_loss(&self, topology_id: u32, leavers: Vec<Address>, members_before: Vec<Address>, lost: Vec<u32>) {
    let report = ResiliencyReport::new(
      topology_id,
      leavers,
      members_before,
      lost,
      self.distribution.num_segments(),
    );
    if report.is_data_lost() {
      warn!(
        node = %self.local,
        topology_id,
        leavers = ?report.leavers,
        lost_segments = report.lost_segments.len(),
        estimated_loss_fraction = report.estimated_loss_fraction,
        "members left before their segments were replicated, data lost"
      );
      Metrics::add(&self.metrics.segments_lost, report.lost_segments.len() as u64);
    } else {
      info!(node = %self.local, topology_id, leavers = ?report.leavers, "members crashed, no segment lost");
    }
    self.metrics.record_loss_fraction(report.estimated_loss_fraction);
    self.reports.lock().push(report);
  }
}

impl<K, V> Lifecycle for ClusterTopologyManager<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  fn name(&self) -> &'static str {
    "cluster"
  }

  fn start(&self) -> Result<()> {
    self.join()
  }

  fn stop(&self) -> Result<()> {
    self.leave()
  }
}

/// The partition whose entries win a merge: most members, then the highest
/// topology id, then the one containing `coordinator`.
pub(crate) fn preferred_partition<'a>(partitions: &'a [Partition], coordinator: &Address) -> Option<&'a Partition> {
  partitions.iter().max_by_key(|p| {
    (
      p.members.len(),
      p.topology.topology_id(),
      p.members.contains(coordinator),
    )
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn partition(names: &[&str], topology_id: u32) -> Partition {
    let members: Vec<Address> = names.iter().map(|n| Address::new(n)).collect();
    let ch = ConsistentHashFactory.create(2, 8, &members);
    Partition {
      members,
      topology: CacheTopology::stable(topology_id, ch),
    }
  }

  fn names(p: &Partition) -> Vec<&str> {
    p.members.iter().map(|a| a.name()).collect()
  }

  #[test]
  fn larger_partition_is_preferred() {
    let partitions = vec![partition(&["c"], 9), partition(&["a", "b"], 4)];
    let preferred = preferred_partition(&partitions, &Address::new("c")).unwrap();
    assert_eq!(names(preferred), vec!["a", "b"]);
  }

  #[test]
  fn ties_break_on_topology_id_then_coordinator() {
    let partitions = vec![partition(&["a"], 4), partition(&["b"], 6)];
    let preferred = preferred_partition(&partitions, &Address::new("a")).unwrap();
    assert_eq!(names(preferred), vec!["b"]);

    let partitions = vec![partition(&["a"], 6), partition(&["b"], 6)];
    let preferred = preferred_partition(&partitions, &Address::new("b")).unwrap();
    assert_eq!(names(preferred), vec!["b"]);
    let preferred = preferred_partition(&partitions, &Address::new("a")).unwrap();
    assert_eq!(names(preferred), vec!["a"]);
  }

  #[test]
  fn no_partitions_no_preference() {
    assert!(preferred_partition(&[], &Address::new("a")).is_none());
  }
}
