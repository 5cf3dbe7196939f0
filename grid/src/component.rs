//! Per-node component wiring.
//!
//! The builder constructs every component of a node explicitly, registers it here
//! and hands out references. Components with a lifecycle are started in
//! registration order and stopped in reverse, so a component can rely on
//! everything registered before it.

use crate::error::Result;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

/// Where a component is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentStatus {
  Instantiated,
  Running,
  Stopping,
  Terminated,
  Failed,
}

/// A component with explicit start and stop steps.
pub trait Lifecycle: Send + Sync {
  fn name(&self) -> &'static str;

  fn start(&self) -> Result<()>;

  fn stop(&self) -> Result<()> {
    Ok(())
  }
}

struct Managed {
  component: Arc<dyn Lifecycle>,
  status: ComponentStatus,
}

/// The components of one node, by type.
pub struct ComponentRegistry {
  components: DashMap<TypeId, Arc<dyn Any + Send + Sync>, ahash::RandomState>,
  lifecycle: Mutex<Vec<Managed>>,
}

impl fmt::Debug for ComponentRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let lifecycle = self.lifecycle.lock();
    f.debug_struct("ComponentRegistry")
      .field("components", &self.components.len())
      .field(
        "lifecycle",
        &lifecycle
          .iter()
          .map(|m| (m.component.name(), m.status))
          .collect::<Vec<_>>(),
      )
      .finish()
  }
}

impl Default for ComponentRegistry {
  fn default() -> Self {
    Self {
      components: DashMap::with_hasher(ahash::RandomState::new()),
      lifecycle: Mutex::new(Vec::new()),
    }
  }
}

impl ComponentRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers `component` under its type, replacing a previous registration.
  pub fn register<T: Any + Send + Sync>(&self, component: Arc<T>) {
    self.components.insert(TypeId::of::<T>(), component);
  }

  pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
    let component = self.components.get(&TypeId::of::<T>())?.value().clone();
    component.downcast::<T>().ok()
  }

  /// Adds a component to the start/stop sequence.
  pub fn manage(&self, component: Arc<dyn Lifecycle>) {
    self.lifecycle.lock().push(Managed {
      component,
      status: ComponentStatus::Instantiated,
    });
  }

  pub fn status(&self, name: &str) -> Option<ComponentStatus> {
    self
      .lifecycle
      .lock()
      .iter()
      .find(|m| m.component.name() == name)
      .map(|m| m.status)
  }

  /// Starts every managed component that is not running, in registration order.
  /// If one fails, the components started so far are stopped again.
  pub fn start_all(&self) -> Result<()> {
    let mut lifecycle = self.lifecycle.lock();
    for index in 0..lifecycle.len() {
      let managed = &mut lifecycle[index];
      if managed.status == ComponentStatus::Running {
        continue;
      }
      debug!(component = managed.component.name(), "starting component");
      if let Err(e) = managed.component.start() {
        error!(component = managed.component.name(), error = %e, "component failed to start");
        managed.status = ComponentStatus::Failed;
        let _ = stop_in_reverse(&mut lifecycle[..index]);
        return Err(e);
      }
      managed.status = ComponentStatus::Running;
    }
    Ok(())
  }

  /// Stops every running component in reverse registration order. All of them
  /// are stopped even if one fails; the first failure is returned.
  pub fn stop_all(&self) -> Result<()> {
    let mut lifecycle = self.lifecycle.lock();
    stop_in_reverse(&mut lifecycle)
  }
}

fn stop_in_reverse(components: &mut [Managed]) -> Result<()> {
  let mut first_error = None;
  for managed in components.iter_mut().rev() {
    if managed.status != ComponentStatus::Running {
      continue;
    }
    managed.status = ComponentStatus::Stopping;
    debug!(component = managed.component.name(), "stopping component");
    match managed.component.stop() {
      Ok(()) => managed.status = ComponentStatus::Terminated,
      Err(e) => {
        warn!(component = managed.component.name(), error = %e, "component failed to stop");
        managed.status = ComponentStatus::Failed;
        first_error.get_or_insert(e);
      }
    }
  }
  match first_error {
    Some(e) => Err(e),
    None => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::GridError;

  struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    fail_start: bool,
  }

  impl Lifecycle for Recorder {
    fn name(&self) -> &'static str {
      self.name
    }

    fn start(&self) -> Result<()> {
      if self.fail_start {
        return Err(GridError::IllegalState("boom".into()));
      }
      self.log.lock().push(format!("start {}", self.name));
      Ok(())
    }

    fn stop(&self) -> Result<()> {
      self.log.lock().push(format!("stop {}", self.name));
      Ok(())
    }
  }

  fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, fail_start: bool) -> Arc<Recorder> {
    Arc::new(Recorder {
      name,
      log: log.clone(),
      fail_start,
    })
  }

  #[test]
  fn components_are_looked_up_by_type() {
    let registry = ComponentRegistry::new();
    registry.register(Arc::new(42u32));
    registry.register(Arc::new("node-a".to_string()));

    assert_eq!(*registry.get::<u32>().unwrap(), 42);
    assert_eq!(registry.get::<String>().unwrap().as_str(), "node-a");
    assert!(registry.get::<u64>().is_none());
  }

  #[test]
  fn start_in_order_stop_in_reverse() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ComponentRegistry::new();
    registry.manage(recorder("persistence", &log, false));
    registry.manage(recorder("container", &log, false));
    registry.manage(recorder("cluster", &log, false));

    registry.start_all().unwrap();
    assert_eq!(registry.status("cluster"), Some(ComponentStatus::Running));
    registry.stop_all().unwrap();
    assert_eq!(registry.status("persistence"), Some(ComponentStatus::Terminated));

    assert_eq!(
      *log.lock(),
      vec![
        "start persistence",
        "start container",
        "start cluster",
        "stop cluster",
        "stop container",
        "stop persistence"
      ]
    );
  }

  #[test]
  fn failed_start_unwinds_started_components() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ComponentRegistry::new();
    registry.manage(recorder("persistence", &log, false));
    registry.manage(recorder("cluster", &log, true));

    assert!(registry.start_all().is_err());
    assert_eq!(registry.status("cluster"), Some(ComponentStatus::Failed));
    assert_eq!(registry.status("persistence"), Some(ComponentStatus::Terminated));
    assert_eq!(*log.lock(), vec!["start persistence", "stop persistence"]);
  }
}
