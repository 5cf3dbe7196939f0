use crate::cache::GridCache;
use crate::cluster::ClusterTopologyManager;
use crate::component::ComponentRegistry;
use crate::config::{validate, EvictionStrategy, GridConfig, PartitionHandling};
use crate::conflict::{ConflictManager, EntryMergePolicy, MergePolicyRegistry};
use crate::container::{ContainerService, DataContainer};
use crate::distribution::DistributionManager;
use crate::error::{ConfigError, GridError};
use crate::handler::CommandHandler;
use crate::invocation::Invoker;
use crate::lock::LockManager;
use crate::metrics::Metrics;
use crate::notifications::{CacheListener, ListenerRegistry};
use crate::persistence::{NonBlockingStore, PersistenceManager};
use crate::remoting::{Address, InboundHandler, LocalNetwork, Transport};
use crate::statetransfer::{StateConsumer, StateProvider, StateTransferLock, StateTransferManager};
use crate::time::{DefaultTimeService, TimeService};

use core::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

/// Where the node gets its transport from.
enum Membership<K, V> {
  Network(LocalNetwork<K, V>),
  Transport(Arc<dyn Transport<K, V>>),
}

/// A builder for grid nodes.
///
/// ```
/// use fibre_grid::{GridBuilder, LocalNetwork};
///
/// let network = LocalNetwork::<String, u64>::new();
/// let node = GridBuilder::new("node-a")
///   .num_owners(2)
///   .num_segments(64)
///   .network(&network)
///   .build()
///   .unwrap();
///
/// node.put("answer".to_string(), 42).unwrap();
/// assert_eq!(node.get(&"answer".to_string()).unwrap().as_deref(), Some(&42));
/// ```
pub struct GridBuilder<K, V> {
  address: Address,
  config: GridConfig,
  membership: Option<Membership<K, V>>,
  store: Option<Arc<dyn NonBlockingStore<K, V>>>,
  time: Option<Arc<dyn TimeService>>,
  merge_policies: MergePolicyRegistry<K, V>,
  listeners: Vec<Arc<dyn CacheListener<K, V>>>,
}

// Manual Debug implementation for GridBuilder.
impl<K, V> fmt::Debug for GridBuilder<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("GridBuilder")
      .field("address", &self.address)
      .field("config", &self.config)
      .field("has_store", &self.store.is_some())
      .field("listeners", &self.listeners.len())
      .finish_non_exhaustive()
  }
}

// --- General Configuration Methods ---
impl<K: 'static, V: 'static> GridBuilder<K, V> {
  /// Starts a builder for the node named `address`, with default settings.
  pub fn new(address: impl Into<Address>) -> Self {
    Self {
      address: address.into(),
      config: GridConfig::default(),
      membership: None,
      store: None,
      time: None,
      merge_policies: MergePolicyRegistry::default(),
      listeners: Vec::new(),
    }
  }

  /// Replaces the whole configuration. Later setters override single fields.
  pub fn config(mut self, config: GridConfig) -> Self {
    self.config = config;
    self
  }

  pub fn num_owners(mut self, num_owners: usize) -> Self {
    self.config.clustering.num_owners = num_owners;
    self
  }

  pub fn num_segments(mut self, num_segments: u32) -> Self {
    self.config.clustering.num_segments = num_segments;
    self
  }

  pub fn remote_timeout(mut self, timeout: Duration) -> Self {
    self.config.clustering.remote_timeout = timeout;
    self
  }

  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.config.clustering.max_retries = max_retries;
    self
  }

  pub fn lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
    self.config.locking.acquire_timeout = timeout;
    self
  }

  /// Sets the number of lock stripes, rounded up to a power of two.
  pub fn concurrency_level(mut self, level: usize) -> Self {
    self.config.locking.concurrency_level = level.max(1).next_power_of_two();
    self
  }

  /// Default lifespan of entries written without explicit metadata.
  pub fn lifespan(mut self, lifespan: Duration) -> Self {
    self.config.expiration.lifespan = Some(lifespan);
    self
  }

  /// Default max-idle of entries written without explicit metadata.
  pub fn max_idle(mut self, max_idle: Duration) -> Self {
    self.config.expiration.max_idle = Some(max_idle);
    self
  }

  /// Interval of the background expiration reaper. `None` leaves expiry lazy.
  pub fn reaper_interval(mut self, interval: Option<Duration>) -> Self {
    self.config.expiration.reaper_interval = interval;
    self
  }

  /// Bounds the number of entries this node keeps in memory.
  pub fn max_count(mut self, max_count: u64) -> Self {
    self.config.memory.max_count = Some(max_count);
    self
  }

  pub fn eviction(mut self, strategy: EvictionStrategy) -> Self {
    self.config.memory.eviction = strategy;
    self
  }

  /// Attaches a persistence store.
  pub fn store(mut self, store: Arc<dyn NonBlockingStore<K, V>>) -> Self {
    self.store = Some(store);
    self
  }

  pub fn passivation(mut self, enabled: bool) -> Self {
    self.config.persistence.passivation = enabled;
    self
  }

  pub fn preload(mut self, enabled: bool) -> Self {
    self.config.persistence.preload = enabled;
    self
  }

  pub fn state_transfer_timeout(mut self, timeout: Duration) -> Self {
    self.config.state_transfer.timeout = timeout;
    self
  }

  /// Names the merge policy applied automatically after a partition merge.
  /// `None` leaves conflicts in place.
  pub fn merge_policy(mut self, name: Option<&str>) -> Self {
    self.config.partition_handling.merge_policy = name.map(str::to_string);
    self
  }

  /// What a partition that lost every owner of some segment still serves.
  pub fn when_split(mut self, handling: PartitionHandling) -> Self {
    self.config.partition_handling.when_split = handling;
    self
  }

  /// Makes a custom merge policy available under `name`.
  pub fn register_merge_policy(self, name: impl Into<String>, policy: Arc<dyn EntryMergePolicy<K, V>>) -> Self {
    self.merge_policies.register(name, policy);
    self
  }

  /// Joins the node to an in-process network.
  pub fn network(mut self, network: &LocalNetwork<K, V>) -> Self {
    self.membership = Some(Membership::Network(network.clone()));
    self
  }

  /// Uses a custom transport. The node takes its address from it.
  pub fn transport(mut self, transport: Arc<dyn Transport<K, V>>) -> Self {
    self.membership = Some(Membership::Transport(transport));
    self
  }

  pub fn time_service(mut self, time: Arc<dyn TimeService>) -> Self {
    self.time = Some(time);
    self
  }

  /// Registers a listener before the node joins, so it observes the first
  /// topology and the state it receives.
  pub fn listener(mut self, listener: Arc<dyn CacheListener<K, V>>) -> Self {
    self.listeners.push(listener);
    self
  }
}

// --- Build Method ---
impl<K, V> GridBuilder<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  /// Validates the configuration, wires the node's components, starts them and
  /// joins the cluster.
  pub fn build(self) -> Result<GridCache<K, V>, GridError> {
    validate(&self.config)?;
    let default_policy = self
      .merge_policies
      .resolve(self.config.partition_handling.merge_policy.as_deref())?;

    let transport: Arc<dyn Transport<K, V>> = match self.membership {
      Some(Membership::Network(network)) => network.transport(self.address.clone()) as Arc<dyn Transport<K, V>>,
      Some(Membership::Transport(transport)) => transport,
      None => return Err(ConfigError::TransportRequired.into()),
    };
    let local = transport.local_address().clone();
    let config = self.config;
    let time = self.time.unwrap_or_else(|| Arc::new(DefaultTimeService));
    debug!(node = %local, ?config, "building grid node");

    let metrics = Arc::new(Metrics::new());
    let listeners = Arc::new(ListenerRegistry::new());
    for listener in self.listeners {
      listeners.add(listener);
    }

    let distribution = Arc::new(DistributionManager::new(
      local.clone(),
      config.clustering.num_owners,
      config.clustering.num_segments,
    ));
    let persistence = self.store.map(|store| {
      Arc::new(PersistenceManager::new(
        store,
        config.persistence.clone(),
        metrics.clone(),
      ))
    });
    let container = Arc::new(DataContainer::new(
      distribution.clone(),
      time,
      &config.memory,
      metrics.clone(),
      listeners.clone(),
      persistence.clone(),
    ));
    let locks = Arc::new(LockManager::new(
      local.clone(),
      config.locking.concurrency_level,
      config.locking.acquire_timeout,
      metrics.clone(),
    ));
    let state_lock = Arc::new(StateTransferLock::new());
    let invoker = Arc::new(Invoker::new(
      transport.clone(),
      distribution.clone(),
      locks.clone(),
      container.clone(),
      state_lock.clone(),
      metrics.clone(),
      config.clustering.clone(),
      config.partition_handling.when_split,
    ));
    let consumer = StateConsumer::new(
      local.clone(),
      transport.clone(),
      container.clone(),
      metrics.clone(),
      config.state_transfer.timeout,
    );
    let state_transfer = Arc::new(StateTransferManager::new(
      local.clone(),
      distribution.clone(),
      state_lock,
      locks.clone(),
      consumer,
      listeners.clone(),
      metrics.clone(),
    ));
    let conflicts = Arc::new(ConflictManager::new(
      transport.clone(),
      distribution.clone(),
      container.clone(),
      invoker.clone(),
      default_policy,
      metrics.clone(),
      config.clustering.remote_timeout,
    ));
    let cluster = Arc::new(ClusterTopologyManager::new(
      transport,
      distribution.clone(),
      state_transfer.clone(),
      conflicts.clone(),
      metrics.clone(),
      config.clustering.remote_timeout,
      config.partition_handling.when_split,
    ));
    let handler = Arc::new(CommandHandler::new(
      distribution.clone(),
      invoker.clone(),
      container.clone(),
      StateProvider::new(container.clone(), persistence.clone()),
      state_transfer,
      cluster.clone(),
    ));
    let inbound: Arc<dyn InboundHandler<K, V>> = handler.clone();
    cluster.set_handler(Arc::downgrade(&inbound))?;

    // Lifecycle order: the store, then the container it fills, then membership.
    let registry = ComponentRegistry::new();
    if let Some(persistence) = &persistence {
      registry.register(persistence.clone());
      registry.manage(persistence.clone());
    }
    registry.manage(Arc::new(ContainerService::new(
      container.clone(),
      config.expiration.reaper_interval,
    )));
    registry.register(conflicts);
    registry.register(cluster.clone());
    registry.manage(cluster);

    let cache = GridCache::new(
      config,
      registry,
      distribution,
      container,
      locks,
      invoker,
      listeners,
      metrics,
      handler,
    );
    cache.start()?;
    Ok(cache)
  }
}
