use crate::container::{CacheEntry, DataContainer};
use crate::distribution::{CacheTopology, TopologyPhase};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::remoting::{Address, Command, Transport};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Outcome of processing one topology on the receiving side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
  pub segments_received: usize,
  pub entries_applied: usize,
  /// Segments no owner could provide.
  pub segments_failed: Vec<u32>,
  pub segments_removed: usize,
}

/// Pulls newly owned segments from their previous owners and drops segments
/// that are no longer owned.
pub(crate) struct StateConsumer<K, V> {
  local: Address,
  transport: Arc<dyn Transport<K, V>>,
  container: Arc<DataContainer<K, V>>,
  metrics: Arc<Metrics>,
  timeout: Duration,
}

impl<K, V> fmt::Debug for StateConsumer<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StateConsumer")
      .field("node", &self.local)
      .field("timeout", &self.timeout)
      .finish()
  }
}

impl<K, V> StateConsumer<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub(crate) fn new(
    local: Address,
    transport: Arc<dyn Transport<K, V>>,
    container: Arc<DataContainer<K, V>>,
    metrics: Arc<Metrics>,
    timeout: Duration,
  ) -> Self {
    Self {
      local,
      transport,
      container,
      metrics,
      timeout,
    }
  }

  /// Reacts to a freshly installed topology.
  pub(crate) fn on_topology(&self, previous: Option<&CacheTopology>, topology: &CacheTopology) -> Result<TransferSummary> {
    let mut summary = TransferSummary::default();
    match (topology.phase(), topology.pending_ch()) {
      (TopologyPhase::ReadOldWriteAll, Some(pending)) => {
        let owned_now = topology.current_ch().segments_for_owner(&self.local);
        let incoming: Vec<u32> = pending
          .segments_for_owner(&self.local)
          .difference(&owned_now)
          .copied()
          .collect();
        if !incoming.is_empty() {
          self.fetch(topology, incoming, &mut summary)?;
        }
      }
      (TopologyPhase::Stable, _) => {
        if let Some(previous) = previous {
          let owned_before = previous.write_ch().segments_for_owner(&self.local);
          let owned_now = topology.write_ch().segments_for_owner(&self.local);
          let obsolete: BTreeSet<u32> = owned_before.difference(&owned_now).copied().collect();
          if !obsolete.is_empty() {
            summary.segments_removed = obsolete.len();
            self.container.remove_segments(&obsolete)?;
          }
        }
      }
      _ => {}
    }
    Ok(summary)
  }

  fn fetch(&self, topology: &CacheTopology, segments: Vec<u32>, summary: &mut TransferSummary) -> Result<()> {
    let topology_id = topology.topology_id();
    // Every segment keeps a queue of candidate providers, current owners first.
    let mut queue: Vec<(u32, VecDeque<Address>)> = segments
      .into_iter()
      .map(|segment| {
        let candidates: VecDeque<Address> = topology
          .current_ch()
          .locate_owners(segment)
          .iter()
          .filter(|a| **a != self.local)
          .cloned()
          .collect();
        (segment, candidates)
      })
      .collect();

    while !queue.is_empty() {
      let mut batches: BTreeMap<Address, Vec<(u32, VecDeque<Address>)>> = BTreeMap::new();
      for (segment, mut candidates) in queue.drain(..) {
        match candidates.pop_front() {
          Some(provider) => batches.entry(provider).or_default().push((segment, candidates)),
          None => summary.segments_failed.push(segment),
        }
      }
      for (provider, batch) in batches {
        let requested: Vec<u32> = batch.iter().map(|(s, _)| *s).collect();
        match self.request(&provider, &requested, topology_id) {
          Ok(entries) => {
            let received = entries.len();
            let mut applied = 0;
            for entry in entries {
              if self.container.apply_state(entry)? {
                applied += 1;
              }
            }
            summary.segments_received += requested.len();
            summary.entries_applied += applied;
            Metrics::add(&self.metrics.state_transfer_segments, requested.len() as u64);
            Metrics::add(&self.metrics.state_transfer_entries, applied as u64);
            debug!(
              node = %self.local,
              %provider,
              topology_id,
              segments = requested.len(),
              received,
              applied,
              "received state"
            );
          }
          Err(e) => {
            warn!(node = %self.local, %provider, topology_id, error = %e, "state request failed, trying next owner");
            queue.extend(batch);
          }
        }
      }
    }

    if summary.segments_failed.is_empty() {
      info!(
        node = %self.local,
        topology_id,
        segments = summary.segments_received,
        entries = summary.entries_applied,
        "state transfer completed"
      );
    } else {
      warn!(
        node = %self.local,
        topology_id,
        failed = ?summary.segments_failed,
        "no owner could provide some segments"
      );
    }
    Ok(())
  }

  fn request(&self, provider: &Address, segments: &[u32], topology_id: u32) -> Result<Vec<CacheEntry<K, V>>> {
    let response = self.transport.send(
      provider,
      Command::GetSegments {
        segments: segments.to_vec(),
        topology_id,
      },
      self.timeout,
    )?;
    Ok(response.into_entries())
  }
}
