use once_cell::sync::Lazy;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// The single reference point for wall-clock calculations. Anchoring the wall
// clock to a monotonic `Instant` keeps timestamps from going backwards if the
// system clock is adjusted while the node runs.
static GRID_EPOCH: Lazy<(Instant, u64)> = Lazy::new(|| {
  let wall = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64;
  (Instant::now(), wall)
});

/// Source of time for every expiry decision in the grid.
///
/// Timestamps are milliseconds since the Unix epoch so that entries created on
/// one node can be checked for expiry on another.
pub trait TimeService: Send + Sync + fmt::Debug {
  /// The current wall-clock time in milliseconds.
  fn wall_clock_millis(&self) -> u64;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTimeService;

impl TimeService for DefaultTimeService {
  #[inline]
  fn wall_clock_millis(&self) -> u64 {
    let (start, wall) = *GRID_EPOCH;
    wall + start.elapsed().as_millis() as u64
  }
}

/// A manually driven clock for deterministic expiry tests.
#[derive(Debug)]
pub struct ControlledTimeService {
  now: AtomicU64,
}

impl ControlledTimeService {
  /// Creates a clock frozen at `start_millis`.
  pub fn new(start_millis: u64) -> Self {
    Self {
      now: AtomicU64::new(start_millis),
    }
  }

  /// Moves the clock forward.
  pub fn advance(&self, by: Duration) {
    self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
  }

  /// Sets the clock to an absolute value.
  pub fn set(&self, millis: u64) {
    self.now.store(millis, Ordering::SeqCst);
  }
}

impl Default for ControlledTimeService {
  fn default() -> Self {
    Self::new(1_000_000)
  }
}

impl TimeService for ControlledTimeService {
  fn wall_clock_millis(&self) -> u64 {
    self.now.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_clock_is_monotonic() {
    let time = DefaultTimeService;
    let a = time.wall_clock_millis();
    let b = time.wall_clock_millis();
    assert!(b >= a);
  }

  #[test]
  fn controlled_clock_only_moves_when_told() {
    let time = ControlledTimeService::new(10);
    assert_eq!(time.wall_clock_millis(), 10);
    time.advance(Duration::from_millis(5));
    assert_eq!(time.wall_clock_millis(), 15);
    time.set(2);
    assert_eq!(time.wall_clock_millis(), 2);
  }
}
