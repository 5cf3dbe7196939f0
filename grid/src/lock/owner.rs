use crate::remoting::Address;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::Thread;

use parking_lot::Mutex;

/// The identity a lock is held under.
///
/// Owners carry the address of the node that created them, so ids minted
/// independently on two nodes never collide on a shared primary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockOwner {
  /// All writes of one transaction share the same owner.
  Transaction { origin: Address, id: u64 },
  /// A single non-transactional invocation.
  Invocation { origin: Address, id: u64 },
}

impl LockOwner {
  pub fn origin(&self) -> &Address {
    match self {
      LockOwner::Transaction { origin, .. } | LockOwner::Invocation { origin, .. } => origin,
    }
  }

  pub fn is_transaction(&self) -> bool {
    matches!(self, LockOwner::Transaction { .. })
  }
}

impl fmt::Display for LockOwner {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LockOwner::Transaction { origin, id } => write!(f, "tx-{}@{}", id, origin),
      LockOwner::Invocation { origin, id } => write!(f, "inv-{}@{}", id, origin),
    }
  }
}

#[derive(Debug, Default)]
struct InterruptState {
  interrupted: AtomicBool,
  parked: Mutex<Option<Thread>>,
}

/// Cancels a blocked lock acquisition from another thread.
///
/// Only the waiter registered with this interrupter is woken; other threads
/// waiting on the same key keep waiting.
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
  state: Arc<InterruptState>,
}

impl Interrupter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Aborts the current (or next) wait of the owning context.
  pub fn interrupt(&self) {
    self.state.interrupted.store(true, Ordering::SeqCst);
    if let Some(thread) = self.state.parked.lock().as_ref() {
      thread.unpark();
    }
  }

  pub fn is_interrupted(&self) -> bool {
    self.state.interrupted.load(Ordering::SeqCst)
  }

  /// Clears a pending interruption.
  pub fn reset(&self) {
    self.state.interrupted.store(false, Ordering::SeqCst);
  }

  pub(crate) fn register(&self, thread: Thread) {
    *self.state.parked.lock() = Some(thread);
  }

  pub(crate) fn unregister(&self) {
    self.state.parked.lock().take();
  }
}

/// Per-invocation state threaded through a lock-acquiring operation.
///
/// The context remembers every key that was *possibly* locked, together with
/// the node that holds the lock, in acquisition order. Releasing a key that
/// was never actually locked is a harmless no-op, so entries are recorded as
/// soon as an acquisition is attempted.
#[derive(Debug)]
pub struct InvocationContext<K> {
  owner: LockOwner,
  possibly_locked: Vec<(K, Address)>,
  interrupter: Interrupter,
}

impl<K: PartialEq> InvocationContext<K> {
  pub fn new(owner: LockOwner) -> Self {
    Self {
      owner,
      possibly_locked: Vec::new(),
      interrupter: Interrupter::new(),
    }
  }

  pub fn with_interrupter(owner: LockOwner, interrupter: Interrupter) -> Self {
    Self {
      owner,
      possibly_locked: Vec::new(),
      interrupter,
    }
  }

  #[inline]
  pub fn owner(&self) -> &LockOwner {
    &self.owner
  }

  #[inline]
  pub fn interrupter(&self) -> &Interrupter {
    &self.interrupter
  }

  pub fn is_transactional(&self) -> bool {
    self.owner.is_transaction()
  }

  /// Records `key` as possibly locked on `node`. A key is recorded once; the
  /// first touch defines its position in the release order.
  pub fn add_possibly_locked(&mut self, key: K, node: Address) {
    if !self.possibly_locked.iter().any(|(k, n)| *k == key && *n == node) {
      self.possibly_locked.push((key, node));
    }
  }

  pub fn possibly_locked(&self) -> &[(K, Address)] {
    &self.possibly_locked
  }

  pub fn has_possibly_locked(&self, key: &K) -> bool {
    self.possibly_locked.iter().any(|(k, _)| k == key)
  }

  /// Drains the possibly-locked list in reverse acquisition order.
  pub(crate) fn take_possibly_locked_reversed(&mut self) -> Vec<(K, Address)> {
    let mut keys = std::mem::take(&mut self.possibly_locked);
    keys.reverse();
    keys
  }
}
