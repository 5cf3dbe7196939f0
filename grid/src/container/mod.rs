//! The per-node entry container and the values it stores.

mod data_container;
mod entry;
mod metadata;
pub mod policy;
mod reaper;
mod store;
mod version;

pub use data_container::DataContainer;
pub use entry::CacheEntry;
pub use metadata::Metadata;
pub(crate) use reaper::ContainerService;
pub use version::{EntryVersion, VersionComparison};
