//! Routing of reads and writes to the owners of a key.
//!
//! The originator resolves the key's primary owner in its current topology and
//! either executes the write locally or forwards it. The primary locks the key,
//! mints the entry version, applies the change and replicates it to every other
//! write owner before the lock is released. A command that reaches a node which
//! is no longer the right owner fails with `StaleTopology`; the originator then
//! retries against its refreshed topology.

use crate::config::{ClusteringConfig, PartitionHandling};
use crate::container::{CacheEntry, DataContainer};
use crate::distribution::{CacheTopology, DistributionInfo, DistributionManager};
use crate::error::{GridError, Result, TransportError};
use crate::lock::{Interrupter, InvocationContext, LockManager, LockOwner};
use crate::metrics::Metrics;
use crate::remoting::{Address, Command, Transport, WriteOp};
use crate::statetransfer::StateTransferLock;

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace};

pub(crate) struct Invoker<K, V> {
  local: Address,
  transport: Arc<dyn Transport<K, V>>,
  distribution: Arc<DistributionManager>,
  locks: Arc<LockManager<K>>,
  container: Arc<DataContainer<K, V>>,
  state_lock: Arc<StateTransferLock>,
  metrics: Arc<Metrics>,
  clustering: ClusteringConfig,
  when_split: PartitionHandling,
  next_id: AtomicU64,
}

impl<K, V> fmt::Debug for Invoker<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Invoker")
      .field("node", &self.local)
      .field("max_retries", &self.clustering.max_retries)
      .field("when_split", &self.when_split)
      .finish()
  }
}

impl<K, V> Invoker<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub(crate) fn new(
    transport: Arc<dyn Transport<K, V>>,
    distribution: Arc<DistributionManager>,
    locks: Arc<LockManager<K>>,
    container: Arc<DataContainer<K, V>>,
    state_lock: Arc<StateTransferLock>,
    metrics: Arc<Metrics>,
    clustering: ClusteringConfig,
    when_split: PartitionHandling,
  ) -> Self {
    Self {
      local: distribution.local_address().clone(),
      transport,
      distribution,
      locks,
      container,
      state_lock,
      metrics,
      clustering,
      when_split,
      next_id: AtomicU64::new(1),
    }
  }

  pub(crate) fn invocation_context(&self) -> InvocationContext<K> {
    InvocationContext::new(LockOwner::Invocation {
      origin: self.local.clone(),
      id: self.next_id.fetch_add(1, Ordering::Relaxed),
    })
  }

  pub(crate) fn transaction_context(&self) -> InvocationContext<K> {
    InvocationContext::new(LockOwner::Transaction {
      origin: self.local.clone(),
      id: self.next_id.fetch_add(1, Ordering::Relaxed),
    })
  }

  #[inline]
  fn remote_timeout(&self) -> Duration {
    self.clustering.remote_timeout
  }

  // ---- Originator side ----

  /// Runs `attempt` against the current topology, retrying while the topology is
  /// changing underneath it.
  fn retrying<T>(&self, key: &K, mut attempt: impl FnMut(&CacheTopology) -> Result<T>) -> Result<T> {
    let max_retries = self.clustering.max_retries;
    for retry in 0..=max_retries {
      let topology = self.distribution.current_topology()?;
      let err = match attempt(&topology) {
        Ok(value) => return Ok(value),
        Err(err) if is_topology_failure(&err) => err,
        Err(err) => return Err(err),
      };
      if retry == max_retries {
        break;
      }
      Metrics::incr(&self.metrics.retries);
      debug!(node = %self.local, ?key, retry, error = %err, "retrying against a newer topology");
      match err {
        GridError::StaleTopology { current, .. } if current > topology.topology_id() => {
          self.state_lock.wait_for_topology(current, self.remote_timeout())?;
        }
        _ => self.backoff(retry),
      }
    }
    Err(GridError::ClusterAvailability {
      key: format!("{:?}", key),
      retries: max_retries,
    })
  }

  fn backoff(&self, retry: u32) {
    let base = self.clustering.retry_backoff;
    let jitter_micros = rand::rng().random_range(0..=base.as_micros() as u64);
    thread::sleep(base * (retry + 1) + Duration::from_micros(jitter_micros));
  }

  fn ensure_available(&self, topology: &CacheTopology, key: &K, write: bool) -> Result<()> {
    let mode = topology.availability();
    let allowed = if write {
      self.when_split.allows_writes(mode)
    } else {
      self.when_split.allows_reads(mode)
    };
    if allowed {
      return Ok(());
    }
    Metrics::incr(&self.metrics.availability_rejections);
    Err(GridError::Availability(format!(
      "{} of {:?} denied in degraded topology {} ({:?})",
      if write { "write" } else { "read" },
      key,
      topology.topology_id(),
      self.when_split
    )))
  }

  /// Reads `key` from a read owner, locally if this node is one.
  pub(crate) fn read(&self, key: &K) -> Result<Option<CacheEntry<K, V>>> {
    let segment = self.distribution.get_segment(key);
    self.retrying(key, |topology| {
      self.ensure_available(topology, key, false)?;
      let info = topology.distribution(segment);
      if info.is_read_owner(&self.local) {
        return self.container.get(key);
      }
      let mut last_failure = None;
      for owner in &info.read_owners {
        let command = Command::Read {
          key: key.clone(),
          topology_id: topology.topology_id(),
        };
        match self.transport.send(owner, command, self.remote_timeout()) {
          Ok(response) => return Ok(response.into_entry()),
          Err(e @ (TransportError::Unreachable(_) | TransportError::Timeout { .. })) => {
            trace!(node = %self.local, %owner, error = %e, "read owner unavailable");
            last_failure = Some(e);
          }
          Err(e) => return Err(e.into()),
        }
      }
      Err(match last_failure {
        Some(e) => e.into(),
        None => GridError::ClusterState(format!("segment {} has no owners", segment)),
      })
    })
  }

  /// Executes a modification on the key's primary owner and returns the
  /// previous entry. For conditional operations that did not apply, returns the
  /// entry that prevented them (`PutIfAbsent`) or `None` (`Replace`).
  pub(crate) fn write(&self, ctx: &mut InvocationContext<K>, key: K, op: WriteOp<V>) -> Result<Option<CacheEntry<K, V>>> {
    let segment = self.distribution.get_segment(&key);
    let in_transaction = ctx.is_transactional();
    self.retrying(&key, |topology| {
      self.ensure_available(topology, &key, true)?;
      let primary = primary_of(&topology.distribution(segment))?;
      if in_transaction {
        ctx.add_possibly_locked(key.clone(), primary.clone());
      }
      if primary == self.local {
        return self.execute_write(
          key.clone(),
          op.clone(),
          ctx.owner(),
          topology.topology_id(),
          in_transaction,
          Some(ctx.interrupter()),
        );
      }
      let command = Command::Write {
        key: key.clone(),
        op: op.clone(),
        owner: ctx.owner().clone(),
        topology_id: topology.topology_id(),
        in_transaction,
      };
      Ok(self.transport.send(&primary, command, self.remote_timeout())?.into_entry())
    })
  }

  /// Acquires the key lock on the primary owner on behalf of a transaction.
  pub(crate) fn lock(&self, ctx: &mut InvocationContext<K>, key: &K) -> Result<()> {
    let segment = self.distribution.get_segment(key);
    let timeout = self.locks.default_timeout();
    self.retrying(key, |topology| {
      self.ensure_available(topology, key, true)?;
      let primary = primary_of(&topology.distribution(segment))?;
      ctx.add_possibly_locked(key.clone(), primary.clone());
      if primary == self.local {
        return self.execute_lock(key, ctx.owner(), topology.topology_id(), timeout, Some(ctx.interrupter()));
      }
      let command = Command::Lock {
        key: key.clone(),
        owner: ctx.owner().clone(),
        topology_id: topology.topology_id(),
        timeout,
      };
      self.transport.send(&primary, command, self.remote_timeout())?;
      Ok(())
    })
  }

  /// Releases every possibly locked key of `ctx`, last acquired first, wherever
  /// the lock is held.
  pub(crate) fn release(&self, ctx: &mut InvocationContext<K>) {
    let owner = ctx.owner().clone();
    for (key, node) in ctx.take_possibly_locked_reversed() {
      if node == self.local {
        self.locks.unlock(&key, &owner);
        continue;
      }
      let command = Command::Unlock {
        keys: vec![key],
        owner: owner.clone(),
      };
      if let Err(e) = self.transport.send(&node, command, self.remote_timeout()) {
        // A departed node's locks are dropped when the next topology is installed.
        debug!(node = %self.local, target = %node, error = %e, "remote unlock failed");
      }
    }
  }

  // ---- Owner side ----

  fn await_topology(&self, topology_id: u32) -> Result<()> {
    if topology_id > self.distribution.topology_id() {
      trace!(node = %self.local, topology_id, "waiting for topology");
      self.state_lock.wait_for_topology(topology_id, self.remote_timeout())?;
    }
    Ok(())
  }

  fn stale(&self, topology_id: u32, topology: &CacheTopology) -> GridError {
    GridError::StaleTopology {
      command: topology_id,
      current: topology.topology_id(),
    }
  }

  pub(crate) fn execute_write(
    &self,
    key: K,
    op: WriteOp<V>,
    owner: &LockOwner,
    topology_id: u32,
    in_transaction: bool,
    interrupter: Option<&Interrupter>,
  ) -> Result<Option<CacheEntry<K, V>>> {
    self.await_topology(topology_id)?;
    let _shared = self.state_lock.acquire_shared();
    let topology = self.distribution.current_topology()?;
    let info = topology.distribution(self.distribution.get_segment(&key));
    if !info.is_primary(&self.local) {
      return Err(self.stale(topology_id, &topology));
    }

    let timeout = self.locks.default_timeout();
    if !self.locks.try_lock_interruptibly(&key, owner, timeout, interrupter)? {
      return Err(self.locks.timeout_error(&key, owner, timeout));
    }
    trace!(node = %self.local, ?key, op = op.name(), %owner, "executing write as primary");
    let result = self.apply_as_primary(&topology, &info, key.clone(), op);
    if !in_transaction {
      self.locks.unlock(&key, owner);
    }
    result
  }

  fn apply_as_primary(
    &self,
    topology: &CacheTopology,
    info: &DistributionInfo,
    key: K,
    op: WriteOp<V>,
  ) -> Result<Option<CacheEntry<K, V>>> {
    let existing = self.container.get(&key)?;
    let (value, metadata) = match op {
      WriteOp::Put { value, metadata } => (value, metadata),
      WriteOp::PutIfAbsent { value, metadata } => {
        if existing.is_some() {
          return Ok(existing);
        }
        (value, metadata)
      }
      WriteOp::Replace { value, metadata } => {
        if existing.is_none() {
          return Ok(None);
        }
        (value, metadata)
      }
      WriteOp::Remove => {
        // Replicated even when absent here: a backup may still hold a copy.
        let previous = self.container.remove(&key)?;
        self.replicate(topology, info, key, None)?;
        return Ok(previous);
      }
    };
    let version = self.container.next_version(&key);
    let now = self.container.time_service().wall_clock_millis();
    let entry = CacheEntry::new(key.clone(), value, metadata.without_version().with_version(version), now);
    let previous = self.container.put_entry(entry.clone())?;
    self.replicate(topology, info, key, Some(entry))?;
    Ok(previous)
  }

  fn replicate(
    &self,
    topology: &CacheTopology,
    info: &DistributionInfo,
    key: K,
    entry: Option<CacheEntry<K, V>>,
  ) -> Result<()> {
    for owner in info.write_owners.iter().filter(|o| **o != self.local) {
      let command = Command::Backup {
        key: key.clone(),
        entry: entry.clone(),
        topology_id: topology.topology_id(),
      };
      match self.transport.send(owner, command, self.remote_timeout()) {
        Ok(_) => {}
        Err(TransportError::Unreachable(_)) => {
          // The next topology drops the owner and restores the replica count.
          debug!(node = %self.local, %owner, ?key, "backup owner unreachable");
        }
        Err(e) => return Err(e.into()),
      }
    }
    Ok(())
  }

  pub(crate) fn execute_backup(&self, key: K, entry: Option<CacheEntry<K, V>>, topology_id: u32) -> Result<()> {
    self.await_topology(topology_id)?;
    let _shared = self.state_lock.acquire_shared();
    let topology = self.distribution.current_topology()?;
    let info = topology.distribution(self.distribution.get_segment(&key));
    if !info.is_write_owner(&self.local) {
      trace!(node = %self.local, ?key, "ignoring backup for a segment this node does not own");
      return Ok(());
    }
    match entry {
      Some(entry) => {
        self.container.put_entry(entry)?;
      }
      None => {
        self.container.remove(&key)?;
      }
    }
    Ok(())
  }

  pub(crate) fn execute_read(&self, key: &K, topology_id: u32) -> Result<Option<CacheEntry<K, V>>> {
    self.await_topology(topology_id)?;
    let _shared = self.state_lock.acquire_shared();
    let topology = self.distribution.current_topology()?;
    if !topology
      .distribution(self.distribution.get_segment(key))
      .is_read_owner(&self.local)
    {
      return Err(self.stale(topology_id, &topology));
    }
    self.container.get(key)
  }

  pub(crate) fn execute_lock(
    &self,
    key: &K,
    owner: &LockOwner,
    topology_id: u32,
    timeout: Duration,
    interrupter: Option<&Interrupter>,
  ) -> Result<()> {
    self.await_topology(topology_id)?;
    let _shared = self.state_lock.acquire_shared();
    let topology = self.distribution.current_topology()?;
    if !topology
      .distribution(self.distribution.get_segment(key))
      .is_primary(&self.local)
    {
      return Err(self.stale(topology_id, &topology));
    }
    if self.locks.try_lock_interruptibly(key, owner, timeout, interrupter)? {
      Ok(())
    } else {
      Err(self.locks.timeout_error(key, owner, timeout))
    }
  }

  pub(crate) fn execute_unlock(&self, keys: &[K], owner: &LockOwner) {
    for key in keys.iter().rev() {
      self.locks.unlock(key, owner);
    }
  }
}

fn primary_of(info: &DistributionInfo) -> Result<Address> {
  info
    .primary
    .clone()
    .ok_or_else(|| GridError::ClusterState(format!("segment {} has no primary owner", info.segment)))
}

fn is_topology_failure(err: &GridError) -> bool {
  matches!(
    err,
    GridError::StaleTopology { .. } | GridError::Transport(TransportError::Unreachable(_))
  )
}
