use crate::error::{GridError, Result};

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Orders command execution against topology installation on one node.
///
/// Commands hold the lock shared for their whole execution; installing a
/// topology takes it exclusively, so every command that started under the old
/// topology has finished before the new one becomes visible.
pub struct StateTransferLock {
  lock: RwLock<()>,
  installed: Mutex<u32>,
  changed: Condvar,
}

impl fmt::Debug for StateTransferLock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StateTransferLock")
      .field("topology_id", &*self.installed.lock())
      .finish()
  }
}

impl Default for StateTransferLock {
  fn default() -> Self {
    Self::new()
  }
}

impl StateTransferLock {
  pub fn new() -> Self {
    Self {
      lock: RwLock::new(()),
      installed: Mutex::new(0),
      changed: Condvar::new(),
    }
  }

  /// Shared access for a command. Re-entrant: a command may execute nested
  /// commands on the same thread while a topology installation is queued.
  pub fn acquire_shared(&self) -> RwLockReadGuard<'_, ()> {
    self.lock.read_recursive()
  }

  pub(crate) fn acquire_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
    self.lock.write()
  }

  pub(crate) fn notify_topology_installed(&self, topology_id: u32) {
    let mut installed = self.installed.lock();
    if topology_id > *installed {
      *installed = topology_id;
      self.changed.notify_all();
    }
  }

  pub fn topology_id(&self) -> u32 {
    *self.installed.lock()
  }

  /// Blocks until a topology with at least `topology_id` is installed.
  pub fn wait_for_topology(&self, topology_id: u32, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut installed = self.installed.lock();
    while *installed < topology_id {
      if self.changed.wait_until(&mut installed, deadline).timed_out() && *installed < topology_id {
        return Err(GridError::Timeout(format!(
          "topology {} not installed after {:?}, still at {}",
          topology_id, timeout, *installed
        )));
      }
    }
    Ok(())
  }
}
