use crate::cache::GridCache;
use crate::container::Metadata;
use crate::error::{GridError, Result};
use crate::lock::{Interrupter, InvocationContext, LockOwner};
use crate::remoting::WriteOp;

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::{debug, trace, warn};

/// A pessimistic transaction.
///
/// Every write locks its key on the key's primary owner right away and holds the
/// lock until the transaction ends. Writes are buffered and applied in order on
/// `commit`; reads see the transaction's own buffered writes. Locks are released
/// last acquired first, on commit, rollback or drop.
pub struct Transaction<'a, K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  cache: &'a GridCache<K, V>,
  ctx: InvocationContext<K>,
  writes: Vec<(K, WriteOp<V>)>,
  finished: bool,
}

impl<K, V> fmt::Debug for Transaction<'_, K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Transaction")
      .field("owner", self.ctx.owner())
      .field("writes", &self.writes.len())
      .field("possibly_locked", &self.ctx.possibly_locked().len())
      .finish()
  }
}

impl<'a, K, V> Transaction<'a, K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub(crate) fn new(cache: &'a GridCache<K, V>, ctx: InvocationContext<K>) -> Self {
    trace!(owner = %ctx.owner(), "transaction started");
    Self {
      cache,
      ctx,
      writes: Vec::new(),
      finished: false,
    }
  }

  pub fn owner(&self) -> &LockOwner {
    self.ctx.owner()
  }

  /// A handle that aborts this transaction's lock wait when the primary owner is
  /// the local node.
  pub fn interrupter(&self) -> Interrupter {
    self.ctx.interrupter().clone()
  }

  /// Keys this transaction may hold locks on, in acquisition order.
  pub fn locked_keys(&self) -> Vec<K> {
    self.ctx.possibly_locked().iter().map(|(k, _)| k.clone()).collect()
  }

  pub fn put(&mut self, key: K, value: V) -> Result<()> {
    let metadata = self.cache.default_metadata();
    self.put_with(key, value, metadata)
  }

  pub fn put_with(&mut self, key: K, value: V, metadata: Metadata) -> Result<()> {
    self.cache.invoker().lock(&mut self.ctx, &key)?;
    self.writes.push((
      key,
      WriteOp::Put {
        value: Arc::new(value),
        metadata,
      },
    ));
    Ok(())
  }

  pub fn remove(&mut self, key: &K) -> Result<()> {
    self.cache.invoker().lock(&mut self.ctx, key)?;
    self.writes.push((key.clone(), WriteOp::Remove));
    Ok(())
  }

  /// The latest buffered value of `key`, or the committed one.
  pub fn get(&self, key: &K) -> Result<Option<Arc<V>>> {
    let buffered = self.writes.iter().rev().find(|(k, _)| k == key);
    match buffered {
      Some((_, WriteOp::Remove)) => Ok(None),
      Some((_, WriteOp::Put { value, .. }))
      | Some((_, WriteOp::PutIfAbsent { value, .. }))
      | Some((_, WriteOp::Replace { value, .. })) => Ok(Some(value.clone())),
      None => self.cache.get(key),
    }
  }

  /// Applies the buffered writes in order, then releases every lock.
  ///
  /// Commit is not atomic across keys. If a write fails, the writes before it
  /// stay applied, the rest are dropped and the locks are released anyway. The
  /// error is `GridError::PartialCommit` once at least one write took effect,
  /// or the write's own error when none did.
  pub fn commit(mut self) -> Result<()> {
    self.finished = true;
    let writes = std::mem::take(&mut self.writes);
    let total = writes.len();
    let mut result = Ok(());
    for (applied, (key, op)) in writes.into_iter().enumerate() {
      if let Err(e) = self.cache.invoker().write(&mut self.ctx, key, op) {
        result = Err(match applied {
          0 => e,
          applied => GridError::PartialCommit {
            applied,
            total,
            source: Box::new(e),
          },
        });
        break;
      }
    }
    self.cache.invoker().release(&mut self.ctx);
    match &result {
      Ok(()) => debug!(owner = %self.ctx.owner(), writes = total, "transaction committed"),
      Err(e) => warn!(owner = %self.ctx.owner(), error = %e, "transaction commit failed"),
    }
    result
  }

  /// Discards the buffered writes and releases every lock.
  pub fn rollback(mut self) {
    self.finished = true;
    self.abort();
  }

  fn abort(&mut self) {
    self.writes.clear();
    self.cache.invoker().release(&mut self.ctx);
    debug!(owner = %self.ctx.owner(), "transaction rolled back");
  }
}

impl<K, V> Drop for Transaction<'_, K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  fn drop(&mut self) {
    if !self.finished {
      self.abort();
    }
  }
}
