//! Segment ownership: key partitioning, consistent hashes and versioned topologies.

mod ch;
mod factory;
mod manager;
mod partitioner;
mod topology;

pub use ch::ConsistentHash;
pub use factory::ConsistentHashFactory;
pub use manager::DistributionManager;
pub use partitioner::KeyPartitioner;
pub use topology::{AvailabilityMode, CacheTopology, DistributionInfo, TopologyPhase};
