use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The identity of a cluster member.
///
/// Addresses are cheap to clone and totally ordered so that owner lists and
/// views can be sorted deterministically.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(Arc<str>);

impl Address {
  pub fn new(name: impl AsRef<str>) -> Self {
    Self(Arc::from(name.as_ref()))
  }

  #[inline]
  pub fn name(&self) -> &str {
    &self.0
  }
}

impl fmt::Debug for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for Address {
  fn from(name: &str) -> Self {
    Address::new(name)
  }
}
