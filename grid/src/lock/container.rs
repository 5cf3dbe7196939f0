use crate::error::GridError;
use crate::lock::{Interrupter, LockOwner};
use crate::remoting::Address;

use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

struct LockEntry {
  owner: LockOwner,
  acquired_at: Instant,
  // Threads parked waiting for this key. Every release wakes all of them and
  // they race for the lock again.
  waiters: Vec<Thread>,
}

type Stripe<K> = HashMap<K, LockEntry, ahash::RandomState>;

/// A striped table of exclusive, owner-reentrant per-key locks.
///
/// Locks are not counted: acquiring a key twice under the same owner succeeds
/// immediately and a single release frees it.
pub struct LockContainer<K> {
  stripes: Box<[CachePadded<Mutex<Stripe<K>>>]>,
  hasher: ahash::RandomState,
}

impl<K> fmt::Debug for LockContainer<K> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LockContainer")
      .field("stripes", &self.stripes.len())
      .finish()
  }
}

impl<K> LockContainer<K>
where
  K: Eq + Hash + Clone + fmt::Debug,
{
  /// Creates a lock table with `concurrency_level` stripes, rounded up to a power
  /// of two.
  pub fn new(concurrency_level: usize) -> Self {
    let num_stripes = concurrency_level.max(1).next_power_of_two();
    let hasher = ahash::RandomState::new();
    let stripes = (0..num_stripes)
      .map(|_| CachePadded::new(Mutex::new(HashMap::with_hasher(hasher.clone()))))
      .collect::<Vec<_>>()
      .into_boxed_slice();
    Self { stripes, hasher }
  }

  #[inline]
  fn stripe(&self, key: &K) -> &Mutex<Stripe<K>> {
    let index = self.hasher.hash_one(key) as usize & (self.stripes.len() - 1);
    &self.stripes[index]
  }

  /// Tries to acquire the lock on `key` for `owner`, blocking up to `timeout`.
  ///
  /// Returns `Ok(false)` when the timeout elapses and `Err(Interrupted)` when
  /// `interrupter` fires while waiting.
  pub fn acquire(
    &self,
    key: &K,
    owner: &LockOwner,
    timeout: Duration,
    interrupter: Option<&Interrupter>,
  ) -> Result<bool, GridError> {
    let deadline = Instant::now() + timeout;
    let current = thread::current();

    loop {
      {
        let mut stripe = self.stripe(key).lock();
        match stripe.get_mut(key) {
          None => {
            stripe.insert(
              key.clone(),
              LockEntry {
                owner: owner.clone(),
                acquired_at: Instant::now(),
                waiters: Vec::new(),
              },
            );
            return Ok(true);
          }
          Some(entry) if &entry.owner == owner => return Ok(true),
          Some(entry) => {
            if !entry.waiters.iter().any(|t| t.id() == current.id()) {
              entry.waiters.push(current.clone());
            }
          }
        }
      }

      // Register before checking the flag so an interrupt between the check and
      // the park still unparks us.
      if let Some(i) = interrupter {
        i.register(current.clone());
      }
      if interrupter.is_some_and(|i| i.is_interrupted()) {
        if let Some(i) = interrupter {
          i.unregister();
        }
        self.forget_waiter(key, &current);
        return Err(GridError::Interrupted(format!("{:?}", key)));
      }

      let now = Instant::now();
      if now >= deadline {
        if let Some(i) = interrupter {
          i.unregister();
        }
        self.forget_waiter(key, &current);
        return Ok(false);
      }

      thread::park_timeout(deadline - now);
      if let Some(i) = interrupter {
        i.unregister();
      }
    }
  }

  fn forget_waiter(&self, key: &K, current: &Thread) {
    let mut stripe = self.stripe(key).lock();
    if let Some(entry) = stripe.get_mut(key) {
      entry.waiters.retain(|t| t.id() != current.id());
    }
  }

  /// Releases `key` if it is held by `owner`. Any other call is a no-op.
  pub fn release(&self, key: &K, owner: &LockOwner) -> bool {
    let waiters = {
      let mut stripe = self.stripe(key).lock();
      match stripe.get(key) {
        Some(entry) if &entry.owner == owner => stripe.remove(key).map(|e| e.waiters),
        _ => None,
      }
    };
    match waiters {
      Some(waiters) => {
        for waiter in waiters {
          waiter.unpark();
        }
        true
      }
      None => false,
    }
  }

  pub fn owner(&self, key: &K) -> Option<LockOwner> {
    self.stripe(key).lock().get(key).map(|e| e.owner.clone())
  }

  pub fn is_locked(&self, key: &K) -> bool {
    self.stripe(key).lock().contains_key(key)
  }

  /// How long `key` has been held, if it is locked.
  pub fn held_for(&self, key: &K) -> Option<Duration> {
    self
      .stripe(key)
      .lock()
      .get(key)
      .map(|e| e.acquired_at.elapsed())
  }

  /// The number of keys currently locked.
  pub fn len(&self) -> usize {
    self.stripes.iter().map(|s| s.lock().len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Releases every lock owned by a context created on `owner_origin`. Used when
  /// that node leaves the cluster before it could release its locks.
  pub fn release_all_of(&self, owner_origin: &Address) -> usize {
    let mut released = 0;
    for stripe in self.stripes.iter() {
      let waiters: Vec<Thread> = {
        let mut stripe = stripe.lock();
        let keys: Vec<K> = stripe
          .iter()
          .filter(|(_, e)| e.owner.origin() == owner_origin)
          .map(|(k, _)| k.clone())
          .collect();
        released += keys.len();
        keys
          .iter()
          .filter_map(|k| stripe.remove(k))
          .flat_map(|e| e.waiters)
          .collect()
      };
      for waiter in waiters {
        waiter.unpark();
      }
    }
    released
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  fn owner(id: u64) -> LockOwner {
    LockOwner::Invocation {
      origin: Address::new("n"),
      id,
    }
  }

  #[test]
  fn reentrant_for_same_owner() {
    let locks = LockContainer::new(4);
    let a = owner(1);
    assert!(locks.acquire(&"k", &a, Duration::ZERO, None).unwrap());
    assert!(locks.acquire(&"k", &a, Duration::ZERO, None).unwrap());
    assert_eq!(locks.owner(&"k"), Some(a.clone()));
    assert!(locks.release(&"k", &a));
    assert!(!locks.is_locked(&"k"));
  }

  #[test]
  fn release_by_other_owner_is_a_noop() {
    let locks = LockContainer::new(4);
    let a = owner(1);
    let b = owner(2);
    assert!(locks.acquire(&"k", &a, Duration::ZERO, None).unwrap());
    assert!(!locks.release(&"k", &b));
    assert!(!locks.release(&"missing", &a));
    assert_eq!(locks.owner(&"k"), Some(a));
  }

  #[test]
  fn contended_acquire_times_out() {
    let locks = LockContainer::new(4);
    assert!(locks.acquire(&"k", &owner(1), Duration::ZERO, None).unwrap());
    let started = Instant::now();
    let acquired = locks
      .acquire(&"k", &owner(2), Duration::from_millis(50), None)
      .unwrap();
    assert!(!acquired);
    assert!(started.elapsed() >= Duration::from_millis(50));
  }

  #[test]
  fn waiter_gets_lock_after_release() {
    let locks = Arc::new(LockContainer::new(4));
    assert!(locks.acquire(&"k", &owner(1), Duration::ZERO, None).unwrap());

    let waiter = {
      let locks = locks.clone();
      thread::spawn(move || locks.acquire(&"k", &owner(2), Duration::from_secs(5), None))
    };
    thread::sleep(Duration::from_millis(30));
    locks.release(&"k", &owner(1));

    assert!(waiter.join().unwrap().unwrap());
    assert_eq!(locks.owner(&"k"), Some(owner(2)));
  }

  #[test]
  fn interrupt_aborts_only_the_interrupted_waiter() {
    let locks = Arc::new(LockContainer::new(4));
    assert!(locks.acquire(&"k", &owner(1), Duration::ZERO, None).unwrap());

    let interrupter = Interrupter::new();
    let interrupted = {
      let locks = locks.clone();
      let interrupter = interrupter.clone();
      thread::spawn(move || locks.acquire(&"k", &owner(2), Duration::from_secs(5), Some(&interrupter)))
    };
    let patient = {
      let locks = locks.clone();
      thread::spawn(move || locks.acquire(&"k", &owner(3), Duration::from_secs(5), None))
    };

    thread::sleep(Duration::from_millis(30));
    interrupter.interrupt();
    assert!(matches!(
      interrupted.join().unwrap(),
      Err(GridError::Interrupted(_))
    ));

    locks.release(&"k", &owner(1));
    assert!(patient.join().unwrap().unwrap());
    assert_eq!(locks.owner(&"k"), Some(owner(3)));
  }
}
