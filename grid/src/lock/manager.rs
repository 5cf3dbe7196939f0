use crate::error::{GridError, Result};
use crate::lock::{Interrupter, InvocationContext, LockContainer, LockOwner};
use crate::metrics::Metrics;
use crate::remoting::Address;

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

/// Per-key lock management for one node.
///
/// Only primary owners lock keys. Reads never touch the lock table.
pub struct LockManager<K> {
  container: LockContainer<K>,
  local: Address,
  default_timeout: Duration,
  metrics: Arc<Metrics>,
}

impl<K> fmt::Debug for LockManager<K> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LockManager")
      .field("node", &self.local)
      .field("default_timeout", &self.default_timeout)
      .finish_non_exhaustive()
  }
}

impl<K> LockManager<K>
where
  K: Eq + Hash + Clone + fmt::Debug,
{
  pub fn new(
    local: Address,
    concurrency_level: usize,
    default_timeout: Duration,
    metrics: Arc<Metrics>,
  ) -> Self {
    Self {
      container: LockContainer::new(concurrency_level),
      local,
      default_timeout,
      metrics,
    }
  }

  /// The owner locks acquired through `ctx` are held under. Always the same
  /// value for the same context.
  #[inline]
  pub fn lock_owner<'a>(&self, ctx: &'a InvocationContext<K>) -> &'a LockOwner {
    ctx.owner()
  }

  pub fn default_timeout(&self) -> Duration {
    self.default_timeout
  }

  /// Blocks up to `timeout`. A timeout returns `Ok(false)`, never an error.
  pub fn try_lock(&self, key: &K, owner: &LockOwner, timeout: Duration) -> Result<bool> {
    self.try_lock_interruptibly(key, owner, timeout, None)
  }

  pub(crate) fn try_lock_interruptibly(
    &self,
    key: &K,
    owner: &LockOwner,
    timeout: Duration,
    interrupter: Option<&Interrupter>,
  ) -> Result<bool> {
    let acquired = self.container.acquire(key, owner, timeout, interrupter)?;
    self.after_attempt(key, owner, acquired);
    Ok(acquired)
  }

  /// Like `try_lock`, using the context's owner and interrupter. The key is
  /// recorded as possibly locked before waiting, so a failed or interrupted
  /// attempt is still covered by `unlock_all`.
  pub fn try_lock_in(
    &self,
    ctx: &mut InvocationContext<K>,
    key: &K,
    timeout: Duration,
  ) -> Result<bool> {
    ctx.add_possibly_locked(key.clone(), self.local.clone());
    let owner = ctx.owner().clone();
    let acquired = self
      .container
      .acquire(key, &owner, timeout, Some(ctx.interrupter()))?;
    self.after_attempt(key, &owner, acquired);
    Ok(acquired)
  }

  /// Acquires the lock or fails with `GridError::LockTimeout`.
  pub fn lock(&self, ctx: &mut InvocationContext<K>, key: &K, timeout: Duration) -> Result<()> {
    if self.try_lock_in(ctx, key, timeout)? {
      Ok(())
    } else {
      Err(self.timeout_error(key, ctx.owner(), timeout))
    }
  }

  pub(crate) fn timeout_error(&self, key: &K, owner: &LockOwner, timeout: Duration) -> GridError {
    GridError::LockTimeout {
      key: format!("{:?}", key),
      owner: owner.to_string(),
      timeout,
    }
  }

  fn after_attempt(&self, key: &K, owner: &LockOwner, acquired: bool) {
    if acquired {
      trace!(node = %self.local, ?key, %owner, "lock acquired");
    } else {
      Metrics::incr(&self.metrics.lock_timeouts);
      debug!(
        node = %self.local,
        ?key,
        %owner,
        holder = ?self.container.owner(key).map(|o| o.to_string()),
        "lock acquisition timed out"
      );
    }
  }

  /// Releases `key` if `owner` holds it. Idempotent.
  pub fn unlock(&self, key: &K, owner: &LockOwner) {
    if self.container.release(key, owner) {
      trace!(node = %self.local, ?key, %owner, "lock released");
    }
  }

  /// Releases every key recorded in `ctx` on this node, in reverse acquisition
  /// order. Keys recorded as locked on other nodes are returned, still in
  /// reverse order, so the caller can release them remotely.
  pub fn unlock_all(&self, ctx: &mut InvocationContext<K>) -> Vec<(K, Address)> {
    let owner = ctx.owner().clone();
    let mut remote = Vec::new();
    for (key, node) in ctx.take_possibly_locked_reversed() {
      if node == self.local {
        self.unlock(&key, &owner);
      } else {
        remote.push((key, node));
      }
    }
    remote
  }

  /// Best-effort introspection.
  pub fn is_locked(&self, key: &K) -> bool {
    self.container.is_locked(key)
  }

  pub fn owner(&self, key: &K) -> Option<LockOwner> {
    self.container.owner(key)
  }

  pub fn locked_count(&self) -> usize {
    self.container.len()
  }

  /// Frees locks left behind by a node that is no longer a member.
  pub(crate) fn release_locks_of(&self, departed: &Address) {
    let released = self.container.release_all_of(departed);
    if released > 0 {
      debug!(node = %self.local, %departed, released, "released locks of departed node");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn manager() -> LockManager<String> {
    LockManager::new(
      Address::new("a"),
      8,
      Duration::from_millis(20),
      Arc::new(Metrics::new()),
    )
  }

  #[test]
  fn lock_timeout_is_a_typed_error() {
    let locks = manager();
    let holder = LockOwner::Invocation {
      origin: Address::new("a"),
      id: 1,
    };
    assert!(locks.try_lock(&"k".to_string(), &holder, Duration::ZERO).unwrap());

    let mut ctx = InvocationContext::new(LockOwner::Invocation {
      origin: Address::new("a"),
      id: 2,
    });
    let err = locks
      .lock(&mut ctx, &"k".to_string(), Duration::from_millis(10))
      .unwrap_err();
    assert!(matches!(err, GridError::LockTimeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(locks.metrics.snapshot().lock_timeouts, 1);

    // The failed attempt is still recorded, and releasing it leaves the holder alone.
    assert!(ctx.has_possibly_locked(&"k".to_string()));
    locks.unlock_all(&mut ctx);
    assert_eq!(locks.owner(&"k".to_string()), Some(holder));
  }

  #[test]
  fn unlock_all_releases_local_and_returns_remote_keys() {
    let locks = manager();
    let mut ctx = InvocationContext::new(LockOwner::Transaction {
      origin: Address::new("a"),
      id: 9,
    });
    locks.lock(&mut ctx, &"x".to_string(), Duration::ZERO).unwrap();
    ctx.add_possibly_locked("remote".to_string(), Address::new("b"));
    locks.lock(&mut ctx, &"y".to_string(), Duration::ZERO).unwrap();
    assert_eq!(locks.locked_count(), 2);

    let remote = locks.unlock_all(&mut ctx);
    assert_eq!(remote, vec![("remote".to_string(), Address::new("b"))]);
    assert_eq!(locks.locked_count(), 0);
    // A second call finds nothing left to release.
    assert!(locks.unlock_all(&mut ctx).is_empty());
  }
}
