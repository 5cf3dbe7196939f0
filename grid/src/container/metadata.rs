use crate::config::ExpirationConfig;
use crate::container::EntryVersion;

use std::time::Duration;

/// Expiration settings and version carried by every entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
  lifespan: Option<Duration>,
  max_idle: Option<Duration>,
  version: Option<EntryVersion>,
}

impl Metadata {
  /// Metadata without expiration.
  pub fn new() -> Self {
    Self::default()
  }

  /// Metadata carrying the configured default lifespan and max-idle.
  pub fn from_config(config: &ExpirationConfig) -> Self {
    Self {
      lifespan: config.lifespan,
      max_idle: config.max_idle,
      version: None,
    }
  }

  /// Time to live from creation. `None` never expires.
  pub fn lifespan(mut self, lifespan: Duration) -> Self {
    self.lifespan = Some(lifespan);
    self
  }

  /// Time to live from the last access. `None` never expires.
  pub fn max_idle(mut self, max_idle: Duration) -> Self {
    self.max_idle = Some(max_idle);
    self
  }

  pub fn with_version(mut self, version: EntryVersion) -> Self {
    self.version = Some(version);
    self
  }

  /// A copy without the version, for comparisons that should ignore it.
  pub fn without_version(&self) -> Self {
    Self {
      lifespan: self.lifespan,
      max_idle: self.max_idle,
      version: None,
    }
  }

  #[inline]
  pub fn get_lifespan(&self) -> Option<Duration> {
    self.lifespan
  }

  #[inline]
  pub fn get_max_idle(&self) -> Option<Duration> {
    self.max_idle
  }

  #[inline]
  pub fn version(&self) -> Option<&EntryVersion> {
    self.version.as_ref()
  }

  pub fn is_mortal(&self) -> bool {
    self.lifespan.is_some() || self.max_idle.is_some()
  }
}
