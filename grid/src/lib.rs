//! The consistency core of a distributed, replicated in-memory data grid.
//!
//! # Features
//! - **Segment Ownership**: Keys hash into a fixed number of segments; a
//!   consistent hash assigns each segment a primary owner and backups.
//! - **Per-Key Locking**: Primary owners serialize writes with re-entrant,
//!   timeout-bounded key locks. Pessimistic transactions hold them until commit.
//! - **Versioned Entries**: Every write carries a version minted by the primary,
//!   plus optional lifespan and max-idle expiration.
//! - **Elastic Membership**: Joins and graceful leaves move state before ownership
//!   changes; crashes are recovered and the resulting data loss is measured.
//! - **Conflict Resolution**: After a partition merge, divergent replicas are found
//!   and reconciled with a pluggable merge policy.
//! - **Observability**: Structured `tracing` logs, metrics and synchronous listeners.
//!
//! Nodes communicate through a [`Transport`]; [`LocalNetwork`] connects nodes that
//! live in the same process.

// Public modules that form the API
pub mod builder;
pub mod cache;
pub mod cluster;
pub mod component;
pub mod config;
pub mod conflict;
pub mod container;
pub mod distribution;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod notifications;
pub mod persistence;
pub mod remoting;
pub mod statetransfer;
pub mod time;
pub mod tx;

// Internal, crate-only modules
mod handler;
mod invocation;

// Re-export the primary user-facing types for convenience
pub use builder::GridBuilder;
pub use cache::GridCache;
pub use cluster::ResiliencyReport;
pub use config::GridConfig;
pub use conflict::{ConflictRecord, EntryMergePolicy, ResolutionSummary};
pub use container::{CacheEntry, EntryVersion, Metadata};
pub use error::{ConfigError, GridError, Result, TransportError};
pub use metrics::MetricsSnapshot;
pub use notifications::{CacheEvent, CacheListener};
pub use remoting::{Address, LocalNetwork, Transport};
pub use tx::Transaction;
