//! The persistence collaborator consumed by the entry container.
//!
//! Store implementations live outside the grid core; `DummyInMemoryStore` is a
//! segmented in-memory implementation for tests and embedders.

mod dummy;
mod manager;

pub use dummy::DummyInMemoryStore;
pub use manager::PersistenceManager;

use crate::container::CacheEntry;
use crate::error::Result;

use std::collections::BTreeSet;
use std::fmt;

/// A capability or restriction advertised by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Characteristic {
  /// The store is never written to or deleted from.
  ReadOnly = 1,
  /// The store is never read from.
  WriteOnly = 1 << 1,
  /// All nodes see the same store contents.
  Shareable = 1 << 2,
  /// Operations address individual segments efficiently.
  Segmentable = 1 << 3,
  /// The store discards expired entries itself.
  Expiration = 1 << 4,
}

/// A set of `Characteristic`s.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Characteristics(u8);

impl Characteristics {
  pub const fn empty() -> Self {
    Self(0)
  }

  pub const fn with(self, characteristic: Characteristic) -> Self {
    Self(self.0 | characteristic as u8)
  }

  #[inline]
  pub const fn contains(&self, characteristic: Characteristic) -> bool {
    self.0 & characteristic as u8 != 0
  }
}

impl FromIterator<Characteristic> for Characteristics {
  fn from_iter<I: IntoIterator<Item = Characteristic>>(iter: I) -> Self {
    iter.into_iter().fold(Self::empty(), Self::with)
  }
}

impl fmt::Debug for Characteristics {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    const ALL: [Characteristic; 5] = [
      Characteristic::ReadOnly,
      Characteristic::WriteOnly,
      Characteristic::Shareable,
      Characteristic::Segmentable,
      Characteristic::Expiration,
    ];
    f.debug_set()
      .entries(ALL.iter().filter(|c| self.contains(**c)))
      .finish()
  }
}

/// A segment-aware entry store.
///
/// Every operation names the key's segment so segmented stores can serve and
/// drop whole segments during a rebalance.
pub trait NonBlockingStore<K, V>: Send + Sync {
  fn start(&self) -> Result<()>;

  fn stop(&self) -> Result<()>;

  fn characteristics(&self) -> Characteristics;

  fn load(&self, segment: u32, key: &K) -> Result<Option<CacheEntry<K, V>>>;

  fn write(&self, segment: u32, entry: CacheEntry<K, V>) -> Result<()>;

  /// Returns whether the key was present.
  fn delete(&self, segment: u32, key: &K) -> Result<bool>;

  fn clear(&self) -> Result<()>;

  /// Every entry stored for `segments`.
  fn entries(&self, segments: &BTreeSet<u32>) -> Result<Vec<CacheEntry<K, V>>>;

  /// Drops every entry of `segments`.
  fn remove_segments(&self, segments: &BTreeSet<u32>) -> Result<()>;
}
