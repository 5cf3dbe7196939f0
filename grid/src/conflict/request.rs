use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::thread::{self, Thread};

use parking_lot::Mutex;

enum State<T> {
  Fetching,
  Complete(T),
  // The leading caller unwound before completing; waiters fetch on their own.
  Abandoned,
}

struct Inner<T> {
  state: State<T>,
  waiters: VecDeque<Thread>,
}

/// One in-flight fetch that concurrent callers for the same key wait on.
struct PendingRequest<T> {
  inner: Mutex<Inner<T>>,
}

impl<T: Clone> PendingRequest<T> {
  fn new() -> Self {
    Self {
      inner: Mutex::new(Inner {
        state: State::Fetching,
        waiters: VecDeque::new(),
      }),
    }
  }

  fn finish(&self, state: State<T>) {
    let mut inner = self.inner.lock();
    inner.state = state;
    for waiter in inner.waiters.drain(..) {
      waiter.unpark();
    }
  }

  fn wait(&self) -> Option<T> {
    loop {
      {
        let mut inner = self.inner.lock();
        match &inner.state {
          State::Complete(value) => return Some(value.clone()),
          State::Abandoned => return None,
          State::Fetching => inner.waiters.push_back(thread::current()),
        }
      }
      thread::park();
    }
  }
}

/// Coalesces concurrent fetches of the same key into one.
pub(crate) struct RequestCoalescer<K, T> {
  in_flight: Mutex<HashMap<K, Arc<PendingRequest<T>>, ahash::RandomState>>,
}

struct Leader<'a, K: Eq + Hash, T: Clone> {
  coalescer: &'a RequestCoalescer<K, T>,
  key: &'a K,
  request: Arc<PendingRequest<T>>,
  completed: bool,
}

impl<K: Eq + Hash, T: Clone> Drop for Leader<'_, K, T> {
  fn drop(&mut self) {
    if !self.completed {
      self.coalescer.in_flight.lock().remove(self.key);
      self.request.finish(State::Abandoned);
    }
  }
}

impl<K, T> RequestCoalescer<K, T>
where
  K: Eq + Hash + Clone,
  T: Clone,
{
  pub(crate) fn new() -> Self {
    Self {
      in_flight: Mutex::new(HashMap::default()),
    }
  }

  /// Runs `fetch` unless a fetch for `key` is already running, in which case the
  /// caller waits for and shares its result.
  pub(crate) fn get_or_fetch(&self, key: &K, fetch: impl FnOnce() -> T) -> T {
    let (request, leading) = {
      let mut in_flight = self.in_flight.lock();
      match in_flight.get(key) {
        Some(request) => (request.clone(), false),
        None => {
          let request = Arc::new(PendingRequest::new());
          in_flight.insert(key.clone(), request.clone());
          (request, true)
        }
      }
    };

    if !leading {
      return match request.wait() {
        Some(value) => value,
        None => fetch(),
      };
    }

    let mut leader = Leader {
      coalescer: self,
      key,
      request,
      completed: false,
    };
    let value = fetch();
    self.in_flight.lock().remove(key);
    leader.request.finish(State::Complete(value.clone()));
    leader.completed = true;
    value
  }

  #[cfg(test)]
  fn in_flight(&self) -> usize {
    self.in_flight.lock().len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Barrier;
  use std::time::Duration;

  #[test]
  fn concurrent_callers_share_one_fetch() {
    let coalescer = Arc::new(RequestCoalescer::<String, u32>::new());
    let fetches = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
      .map(|_| {
        let coalescer = coalescer.clone();
        let fetches = fetches.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
          barrier.wait();
          coalescer.get_or_fetch(&"k".to_string(), || {
            fetches.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            7
          })
        })
      })
      .collect();

    for handle in handles {
      assert_eq!(handle.join().unwrap(), 7);
    }
    // Late arrivals after completion fetch again, so only an upper bound holds.
    assert!(fetches.load(Ordering::SeqCst) < 4);
    assert_eq!(coalescer.in_flight(), 0);
  }
}
