//! Merge policies decide which replica wins when partitions merge.

use crate::container::CacheEntry;
use crate::error::ConfigError;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Always keeps the entry of the preferred partition, even if it is absent.
pub const PREFERRED_ALWAYS: &str = "PREFERRED_ALWAYS";
/// Keeps the preferred entry unless it is absent, then the first other entry.
pub const PREFERRED_NON_NULL: &str = "PREFERRED_NON_NULL";
/// Removes every conflicting key.
pub const REMOVE_ALL: &str = "REMOVE_ALL";
/// Leaves conflicts in place on merge.
pub const NONE: &str = "NONE";

/// Picks the winning entry among the replicas of a conflicting key.
///
/// `preferred` is the entry held by the preferred partition (`None` if that
/// partition has no entry), `others` the entries held elsewhere. Returning
/// `None` removes the key from every owner.
pub trait EntryMergePolicy<K, V>: Send + Sync {
  fn merge(&self, preferred: Option<CacheEntry<K, V>>, others: Vec<CacheEntry<K, V>>) -> Option<CacheEntry<K, V>>;
}

impl<K, V, F> EntryMergePolicy<K, V> for F
where
  F: Fn(Option<CacheEntry<K, V>>, Vec<CacheEntry<K, V>>) -> Option<CacheEntry<K, V>> + Send + Sync,
{
  fn merge(&self, preferred: Option<CacheEntry<K, V>>, others: Vec<CacheEntry<K, V>>) -> Option<CacheEntry<K, V>> {
    self(preferred, others)
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreferredAlways;

impl<K, V> EntryMergePolicy<K, V> for PreferredAlways {
  fn merge(&self, preferred: Option<CacheEntry<K, V>>, _others: Vec<CacheEntry<K, V>>) -> Option<CacheEntry<K, V>> {
    preferred
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreferredNonNull;

impl<K, V> EntryMergePolicy<K, V> for PreferredNonNull {
  fn merge(&self, preferred: Option<CacheEntry<K, V>>, others: Vec<CacheEntry<K, V>>) -> Option<CacheEntry<K, V>> {
    preferred.or_else(|| others.into_iter().next())
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveAll;

impl<K, V> EntryMergePolicy<K, V> for RemoveAll {
  fn merge(&self, _preferred: Option<CacheEntry<K, V>>, _others: Vec<CacheEntry<K, V>>) -> Option<CacheEntry<K, V>> {
    None
  }
}

/// Merge policies by name, populated with the built-ins.
pub struct MergePolicyRegistry<K, V> {
  policies: RwLock<HashMap<String, Arc<dyn EntryMergePolicy<K, V>>, ahash::RandomState>>,
}

impl<K, V> fmt::Debug for MergePolicyRegistry<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MergePolicyRegistry")
      .field("policies", &self.names())
      .finish()
  }
}

impl<K: 'static, V: 'static> Default for MergePolicyRegistry<K, V> {
  fn default() -> Self {
    let registry = Self {
      policies: RwLock::new(HashMap::default()),
    };
    registry.register(PREFERRED_ALWAYS, Arc::new(PreferredAlways));
    registry.register(PREFERRED_NON_NULL, Arc::new(PreferredNonNull));
    registry.register(REMOVE_ALL, Arc::new(RemoveAll));
    registry
  }
}

impl<K, V> MergePolicyRegistry<K, V> {
  pub fn register(&self, name: impl Into<String>, policy: Arc<dyn EntryMergePolicy<K, V>>) {
    self.policies.write().insert(name.into(), policy);
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn EntryMergePolicy<K, V>>> {
    self.policies.read().get(name).cloned()
  }

  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.policies.read().keys().cloned().collect();
    names.sort();
    names
  }

  /// Resolves a configured policy name. `None` and `NONE` disable automatic
  /// resolution.
  pub fn resolve(&self, name: Option<&str>) -> Result<Option<Arc<dyn EntryMergePolicy<K, V>>>, ConfigError> {
    match name {
      None => Ok(None),
      Some(name) if name.eq_ignore_ascii_case(NONE) => Ok(None),
      Some(name) => self
        .get(name)
        .map(Some)
        .ok_or_else(|| ConfigError::UnknownMergePolicy(name.to_string())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::container::Metadata;

  fn entry(value: u32) -> CacheEntry<String, u32> {
    CacheEntry::new("k".to_string(), Arc::new(value), Metadata::new(), 0)
  }

  fn value_of(entry: Option<CacheEntry<String, u32>>) -> Option<u32> {
    entry.map(|e| **e.value())
  }

  #[test]
  fn built_in_policies() {
    let registry = MergePolicyRegistry::<String, u32>::default();
    let always = registry.get(PREFERRED_ALWAYS).unwrap();
    let non_null = registry.get(PREFERRED_NON_NULL).unwrap();
    let remove = registry.get(REMOVE_ALL).unwrap();

    assert_eq!(value_of(always.merge(Some(entry(1)), vec![entry(2)])), Some(1));
    assert_eq!(value_of(always.merge(None, vec![entry(2)])), None);
    assert_eq!(value_of(non_null.merge(None, vec![entry(2), entry(3)])), Some(2));
    assert_eq!(value_of(non_null.merge(Some(entry(1)), vec![entry(2)])), Some(1));
    assert_eq!(value_of(remove.merge(Some(entry(1)), vec![entry(2)])), None);
  }

  #[test]
  fn names_resolve_to_policies() {
    let registry = MergePolicyRegistry::<String, u32>::default();
    registry.register(
      "HIGHEST",
      Arc::new(|preferred: Option<CacheEntry<String, u32>>, others: Vec<CacheEntry<String, u32>>| {
        preferred.into_iter().chain(others).max_by_key(|e| **e.value())
      }),
    );
    let highest = registry.resolve(Some("HIGHEST")).unwrap().unwrap();
    assert_eq!(value_of(highest.merge(Some(entry(1)), vec![entry(5), entry(3)])), Some(5));

    assert!(registry.resolve(None).unwrap().is_none());
    assert!(registry.resolve(Some(NONE)).unwrap().is_none());
    assert_eq!(
      registry.resolve(Some("NOPE")).err(),
      Some(ConfigError::UnknownMergePolicy("NOPE".into()))
    );
  }
}
