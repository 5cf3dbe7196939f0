use crate::component::Lifecycle;
use crate::container::DataContainer;
use crate::error::Result;

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, trace, warn};

/// Background thread that periodically purges expired entries.
///
/// The reaper only holds a weak reference to the container; it exits on its own
/// once the container is dropped.
pub(crate) struct ExpirationReaper {
  handle: Option<JoinHandle<()>>,
  stop_flag: Arc<AtomicBool>,
}

impl fmt::Debug for ExpirationReaper {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExpirationReaper")
      .field("stopped", &self.stop_flag.load(Ordering::Relaxed))
      .finish()
  }
}

impl ExpirationReaper {
  pub(crate) fn spawn<K, V>(container: Weak<DataContainer<K, V>>, interval: Duration) -> Self
  where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
  {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_clone = stop_flag.clone();

    let handle = thread::Builder::new()
      .name("grid-expiration-reaper".into())
      .spawn(move || {
        while !stop_clone.load(Ordering::Relaxed) {
          let tick_start = Instant::now();
          let Some(container) = container.upgrade() else {
            break;
          };
          let purged = container.purge_expired();
          drop(container);
          trace!(purged, "reaper tick");

          if let Some(remaining) = interval.checked_sub(tick_start.elapsed()) {
            thread::park_timeout(remaining);
          }
        }
      });

    match handle {
      Ok(handle) => Self {
        handle: Some(handle),
        stop_flag,
      },
      Err(e) => {
        warn!(error = %e, "could not spawn expiration reaper, expiry stays lazy");
        Self {
          handle: None,
          stop_flag,
        }
      }
    }
  }

  /// Signals the thread to stop and waits for it.
  pub(crate) fn stop(&mut self) {
    self.stop_flag.store(true, Ordering::Relaxed);
    if let Some(handle) = self.handle.take() {
      handle.thread().unpark();
      join_reaper(handle);
    }
  }
}

/// Waits for the reaper thread. Returns `false` if it died from a panic.
fn join_reaper(handle: JoinHandle<()>) -> bool {
  match handle.join() {
    Ok(()) => true,
    Err(payload) => {
      let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
      warn!(reason, "expiration reaper panicked, expired entries were only purged lazily");
      false
    }
  }
}

impl Drop for ExpirationReaper {
  fn drop(&mut self) {
    self.stop();
  }
}

/// Preloads the container when the node starts and runs the reaper while it is up.
pub(crate) struct ContainerService<K, V> {
  container: Arc<DataContainer<K, V>>,
  reaper_interval: Option<Duration>,
  reaper: Mutex<Option<ExpirationReaper>>,
}

impl<K, V> ContainerService<K, V> {
  pub(crate) fn new(container: Arc<DataContainer<K, V>>, reaper_interval: Option<Duration>) -> Self {
    Self {
      container,
      reaper_interval,
      reaper: Mutex::new(None),
    }
  }
}

impl<K, V> Lifecycle for ContainerService<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  fn name(&self) -> &'static str {
    "container"
  }

  fn start(&self) -> Result<()> {
    let loaded = self.container.preload()?;
    if loaded > 0 {
      info!(loaded, "preloaded entries from the store");
    }
    if let Some(interval) = self.reaper_interval {
      *self.reaper.lock() = Some(ExpirationReaper::spawn(Arc::downgrade(&self.container), interval));
    }
    Ok(())
  }

  fn stop(&self) -> Result<()> {
    if let Some(mut reaper) = self.reaper.lock().take() {
      reaper.stop();
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::MemoryConfig;
  use crate::container::Metadata;
  use crate::distribution::{CacheTopology, ConsistentHashFactory, DistributionManager};
  use crate::metrics::Metrics;
  use crate::notifications::ListenerRegistry;
  use crate::remoting::Address;
  use crate::time::ControlledTimeService;

  #[test]
  fn reaper_purges_in_the_background() {
    let local = Address::new("a");
    let dm = Arc::new(DistributionManager::new(local.clone(), 1, 4));
    dm.set_topology(CacheTopology::stable(
      1,
      ConsistentHashFactory.create(1, 4, &[local]),
    ));
    let time = Arc::new(ControlledTimeService::default());
    let container = Arc::new(DataContainer::<String, u32>::new(
      dm,
      time.clone(),
      &MemoryConfig::default(),
      Arc::new(Metrics::new()),
      Arc::new(ListenerRegistry::new()),
      None,
    ));
    let metadata = Metadata::new().lifespan(Duration::from_millis(10));
    container.put("k".into(), Arc::new(1), metadata).unwrap();
    time.advance(Duration::from_millis(10));

    let mut reaper = ExpirationReaper::spawn(Arc::downgrade(&container), Duration::from_millis(5));
    let deadline = Instant::now() + Duration::from_secs(5);
    while container.size_including_expired() > 0 && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(5));
    }
    reaper.stop();
    assert_eq!(container.size_including_expired(), 0);
  }

  #[test]
  fn a_panicked_reaper_is_reported_on_join() {
    let handle = thread::spawn(|| panic!("purge failed"));
    assert!(!join_reaper(handle));
    assert!(join_reaper(thread::spawn(|| ())));
  }
}
