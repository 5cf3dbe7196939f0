//! Finding and resolving replicas that diverged while the cluster was split.

mod manager;
pub mod policy;
mod request;

pub use manager::{ConflictIter, ConflictManager, ConflictRecord, ConflictState, ResolutionSummary, Versions};
pub use policy::{EntryMergePolicy, MergePolicyRegistry};
