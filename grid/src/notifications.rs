use crate::remoting::Address;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Events delivered to registered listeners.
///
/// Every event is delivered synchronously, on the thread performing the change,
/// before the triggering call returns. Modification events come in pairs: one
/// with `pre = true` before the container changes and one with `pre = false`
/// after.
pub enum CacheEvent<K, V> {
  /// A key was created (`previous` is `None`) or overwritten.
  Modified {
    key: K,
    previous: Option<Arc<V>>,
    value: Arc<V>,
    pre: bool,
  },
  /// A key was removed explicitly.
  Removed {
    key: K,
    previous: Option<Arc<V>>,
    pre: bool,
  },
  /// A key's lifespan or max-idle elapsed.
  Expired { key: K, value: Arc<V> },
  /// A key was evicted from memory (and passivated, if configured).
  Evicted { key: K, value: Arc<V> },
  /// The node installed a new topology.
  TopologyChanged {
    previous_id: u32,
    topology_id: u32,
    members: Vec<Address>,
    pre: bool,
  },
}

impl<K: fmt::Debug, V> fmt::Debug for CacheEvent<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CacheEvent::Modified { key, previous, pre, .. } => f
        .debug_struct("Modified")
        .field("key", key)
        .field("created", &previous.is_none())
        .field("pre", pre)
        .finish(),
      CacheEvent::Removed { key, pre, .. } => f
        .debug_struct("Removed")
        .field("key", key)
        .field("pre", pre)
        .finish(),
      CacheEvent::Expired { key, .. } => f.debug_struct("Expired").field("key", key).finish(),
      CacheEvent::Evicted { key, .. } => f.debug_struct("Evicted").field("key", key).finish(),
      CacheEvent::TopologyChanged {
        previous_id,
        topology_id,
        pre,
        ..
      } => f
        .debug_struct("TopologyChanged")
        .field("previous_id", previous_id)
        .field("topology_id", topology_id)
        .field("pre", pre)
        .finish(),
    }
  }
}

/// A listener that can be registered with a grid node to observe changes.
///
/// `on_event` runs on the thread that made the change, so it should return
/// quickly and must not block on the cache it observes.
pub trait CacheListener<K, V>: Send + Sync {
  fn on_event(&self, event: &CacheEvent<K, V>);
}

impl<K, V, F> CacheListener<K, V> for F
where
  F: Fn(&CacheEvent<K, V>) + Send + Sync,
{
  fn on_event(&self, event: &CacheEvent<K, V>) {
    self(event)
  }
}

/// Handle returned by `ListenerRegistry::add`, used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The listeners of one node.
pub struct ListenerRegistry<K, V> {
  listeners: RwLock<Vec<(ListenerId, Arc<dyn CacheListener<K, V>>)>>,
  next_id: AtomicU64,
}

impl<K, V> fmt::Debug for ListenerRegistry<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ListenerRegistry")
      .field("listeners", &self.listeners.read().len())
      .finish()
  }
}

impl<K, V> Default for ListenerRegistry<K, V> {
  fn default() -> Self {
    Self {
      listeners: RwLock::new(Vec::new()),
      next_id: AtomicU64::new(1),
    }
  }
}

impl<K, V> ListenerRegistry<K, V> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&self, listener: Arc<dyn CacheListener<K, V>>) -> ListenerId {
    let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self.listeners.write().push((id, listener));
    id
  }

  pub fn remove(&self, id: ListenerId) -> bool {
    let mut listeners = self.listeners.write();
    let before = listeners.len();
    listeners.retain(|(l, _)| *l != id);
    listeners.len() != before
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.listeners.read().is_empty()
  }

  /// Delivers `event` to every listener. The registry lock is not held while
  /// listeners run, so a listener may register or remove listeners.
  pub fn notify(&self, event: &CacheEvent<K, V>) {
    let listeners: Vec<_> = self
      .listeners
      .read()
      .iter()
      .map(|(_, l)| l.clone())
      .collect();
    for listener in listeners {
      listener.on_event(event);
    }
  }

  /// Builds and delivers an event only if someone is listening.
  #[inline]
  pub fn notify_with(&self, event: impl FnOnce() -> CacheEvent<K, V>) {
    if !self.is_empty() {
      self.notify(&event());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;

  #[test]
  fn listeners_receive_events_until_removed() {
    let registry = ListenerRegistry::<String, u32>::new();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let id = {
      let seen = seen.clone();
      registry.add(Arc::new(move |event: &CacheEvent<String, u32>| {
        if let CacheEvent::Expired { key, .. } = event {
          seen.lock().push(key.clone());
        }
      }))
    };

    registry.notify(&CacheEvent::Expired {
      key: "a".to_string(),
      value: Arc::new(1),
    });
    assert!(registry.remove(id));
    assert!(!registry.remove(id));
    registry.notify_with(|| CacheEvent::Expired {
      key: "b".to_string(),
      value: Arc::new(2),
    });

    assert_eq!(*seen.lock(), vec!["a".to_string()]);
  }
}
