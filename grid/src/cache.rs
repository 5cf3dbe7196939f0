use crate::cluster::{ClusterTopologyManager, ResiliencyReport};
use crate::component::ComponentRegistry;
use crate::config::GridConfig;
use crate::conflict::{ConflictManager, EntryMergePolicy, ResolutionSummary};
use crate::container::{CacheEntry, DataContainer, Metadata};
use crate::distribution::{AvailabilityMode, CacheTopology, DistributionManager};
use crate::error::{GridError, Result};
use crate::handler::CommandHandler;
use crate::invocation::Invoker;
use crate::lock::LockManager;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::notifications::{CacheListener, ListenerId, ListenerRegistry};
use crate::remoting::{Address, WriteOp};
use crate::tx::Transaction;

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

/// One node's view of a distributed cache.
///
/// Every operation is routed to the owners of its key through the node's
/// current topology; callers never need to know where a key lives. A
/// `GridCache` is created with a `GridBuilder` and has already joined the
/// cluster when the builder returns it.
pub struct GridCache<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  local: Address,
  config: GridConfig,
  registry: ComponentRegistry,
  distribution: Arc<DistributionManager>,
  container: Arc<DataContainer<K, V>>,
  locks: Arc<LockManager<K>>,
  invoker: Arc<Invoker<K, V>>,
  listeners: Arc<ListenerRegistry<K, V>>,
  metrics: Arc<Metrics>,
  // The transport only holds a weak reference to the handler.
  _handler: Arc<CommandHandler<K, V>>,
  stopped: AtomicBool,
}

impl<K, V> fmt::Debug for GridCache<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("GridCache")
      .field("node", &self.local)
      .field("topology_id", &self.distribution.topology_id())
      .field("local_entries", &self.container.size())
      .field("stopped", &self.stopped.load(Ordering::Relaxed))
      .finish()
  }
}

impl<K, V> GridCache<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    config: GridConfig,
    registry: ComponentRegistry,
    distribution: Arc<DistributionManager>,
    container: Arc<DataContainer<K, V>>,
    locks: Arc<LockManager<K>>,
    invoker: Arc<Invoker<K, V>>,
    listeners: Arc<ListenerRegistry<K, V>>,
    metrics: Arc<Metrics>,
    handler: Arc<CommandHandler<K, V>>,
  ) -> Self {
    Self {
      local: distribution.local_address().clone(),
      config,
      registry,
      distribution,
      container,
      locks,
      invoker,
      listeners,
      metrics,
      _handler: handler,
      stopped: AtomicBool::new(false),
    }
  }

  /// Starts every component: persistence, the container (preload and reaper),
  /// then joins the cluster.
  pub(crate) fn start(&self) -> Result<()> {
    self.registry.start_all()?;
    info!(
      node = %self.local,
      topology_id = self.distribution.topology_id(),
      "grid node started"
    );
    Ok(())
  }

  #[inline]
  fn ensure_running(&self) -> Result<()> {
    if self.stopped.load(Ordering::Acquire) {
      return Err(GridError::IllegalState(format!("grid node {} is stopped", self.local)));
    }
    Ok(())
  }

  pub(crate) fn invoker(&self) -> &Invoker<K, V> {
    &self.invoker
  }

  pub(crate) fn default_metadata(&self) -> Metadata {
    Metadata::from_config(&self.config.expiration)
  }

  // --- Reads ---

  pub fn get(&self, key: &K) -> Result<Option<Arc<V>>> {
    Ok(self.get_entry(key)?.map(|e| e.value().clone()))
  }

  /// The entry of `key` including its metadata and version.
  pub fn get_entry(&self, key: &K) -> Result<Option<CacheEntry<K, V>>> {
    self.ensure_running()?;
    let entry = self.invoker.read(key)?;
    if entry.is_some() {
      Metrics::incr(&self.metrics.hits);
    } else {
      Metrics::incr(&self.metrics.misses);
    }
    Ok(entry)
  }

  pub fn contains_key(&self, key: &K) -> Result<bool> {
    self.ensure_running()?;
    Ok(self.invoker.read(key)?.is_some())
  }

  // --- Writes ---

  /// Stores `value` with the configured default expiration and returns the
  /// previous value.
  pub fn put(&self, key: K, value: V) -> Result<Option<Arc<V>>> {
    self.put_with(key, value, self.default_metadata())
  }

  pub fn put_with(&self, key: K, value: V, metadata: Metadata) -> Result<Option<Arc<V>>> {
    self.write(
      key,
      WriteOp::Put {
        value: Arc::new(value),
        metadata,
      },
    )
  }

  /// Stores `value` only if `key` is absent. Returns the existing value if
  /// there was one, in which case nothing changed.
  pub fn put_if_absent(&self, key: K, value: V) -> Result<Option<Arc<V>>> {
    self.write(
      key,
      WriteOp::PutIfAbsent {
        value: Arc::new(value),
        metadata: self.default_metadata(),
      },
    )
  }

  /// Replaces the value of `key` only if it is present. Returns the replaced
  /// value, or `None` if nothing changed.
  pub fn replace(&self, key: K, value: V) -> Result<Option<Arc<V>>> {
    self.write(
      key,
      WriteOp::Replace {
        value: Arc::new(value),
        metadata: self.default_metadata(),
      },
    )
  }

  pub fn remove(&self, key: &K) -> Result<Option<Arc<V>>> {
    self.write(key.clone(), WriteOp::Remove)
  }

  fn write(&self, key: K, op: WriteOp<V>) -> Result<Option<Arc<V>>> {
    self.ensure_running()?;
    let mut ctx = self.invoker.invocation_context();
    let previous = self.invoker.write(&mut ctx, key, op)?;
    Ok(previous.map(|e| e.value().clone()))
  }

  /// Starts a pessimistic transaction on this node.
  pub fn begin(&self) -> Result<Transaction<'_, K, V>> {
    self.ensure_running()?;
    Ok(Transaction::new(self, self.invoker.transaction_context()))
  }

  // --- Listeners and metrics ---

  pub fn add_listener(&self, listener: Arc<dyn CacheListener<K, V>>) -> ListenerId {
    self.listeners.add(listener)
  }

  pub fn remove_listener(&self, id: ListenerId) -> bool {
    self.listeners.remove(id)
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  // --- Conflicts and resiliency ---

  pub fn conflict_manager(&self) -> Result<Arc<ConflictManager<K, V>>> {
    self
      .registry
      .get::<ConflictManager<K, V>>()
      .ok_or_else(|| GridError::IllegalState("conflict manager not registered".into()))
  }

  /// Resolves every conflict in the cluster with the configured merge policy.
  pub fn resolve_conflicts(&self) -> Result<ResolutionSummary> {
    self.ensure_running()?;
    self.conflict_manager()?.resolve_conflicts()
  }

  pub fn resolve_conflicts_with(&self, policy: &dyn EntryMergePolicy<K, V>) -> Result<ResolutionSummary> {
    self.ensure_running()?;
    self.conflict_manager()?.resolve_conflicts_with(policy)
  }

  /// Data loss reported while this node coordinated crash recovery.
  pub fn resiliency_reports(&self) -> Vec<ResiliencyReport> {
    self
      .registry
      .get::<ClusterTopologyManager<K, V>>()
      .map(|cluster| cluster.resiliency_reports())
      .unwrap_or_default()
  }

  // --- Node state ---

  pub fn address(&self) -> &Address {
    &self.local
  }

  pub fn config(&self) -> &GridConfig {
    &self.config
  }

  pub fn topology(&self) -> Result<Arc<CacheTopology>> {
    self.distribution.current_topology()
  }

  pub fn topology_id(&self) -> u32 {
    self.distribution.topology_id()
  }

  pub fn members(&self) -> Vec<Address> {
    self
      .distribution
      .try_current_topology()
      .map(|t| t.members().to_vec())
      .unwrap_or_default()
  }

  /// `Degraded` while this node's partition misses every owner of some segment.
  pub fn availability(&self) -> AvailabilityMode {
    self
      .distribution
      .try_current_topology()
      .map_or(AvailabilityMode::Available, |t| t.availability())
  }

  pub fn distribution(&self) -> &Arc<DistributionManager> {
    &self.distribution
  }

  /// The entries held by this node, as primary or backup owner.
  pub fn data_container(&self) -> &Arc<DataContainer<K, V>> {
    &self.container
  }

  pub fn lock_manager(&self) -> &Arc<LockManager<K>> {
    &self.locks
  }

  pub fn is_stopped(&self) -> bool {
    self.stopped.load(Ordering::Acquire)
  }

  /// Leaves the cluster gracefully and stops every component. The node's
  /// segments are handed over to the remaining members before it disconnects.
  pub fn stop(&self) -> Result<()> {
    if self.stopped.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    let result = self.registry.stop_all();
    info!(node = %self.local, "grid node stopped");
    result
  }
}

impl<K, V> Drop for GridCache<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  fn drop(&mut self) {
    if let Err(e) = self.stop() {
      warn!(node = %self.local, error = %e, "error stopping grid node on drop");
    }
  }
}
