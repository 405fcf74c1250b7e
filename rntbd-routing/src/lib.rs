//! # rntbd-routing
//!
//! Decides which partition and which server own a key:
//! - MurmurHash3 (x86 32-bit, x64 128-bit)
//! - Partition key components, their hashing and order-preserving binary
//!   encodings, and effective partition key computation (v1/v2 hash,
//!   hierarchical multi-hash, range)
//! - Ranges and the collection routing map from effective partition keys
//!   to partition key ranges
//! - A consistent hash ring for replica placement

pub mod error;
pub mod hash_ring;
pub mod murmur;
pub mod partition_key;
pub mod range;
pub mod routing_map;

pub use error::RoutingError;
pub use hash_ring::{ConsistentHashRing, HashGenerator, Murmur3HashGenerator};
pub use partition_key::{
    PartitionKeyComponent, PartitionKeyDefinition, PartitionKeyDefinitionVersion,
    PartitionKeyInternal, PartitionKind, MAX_EXCLUSIVE_EFFECTIVE_PARTITION_KEY,
    MIN_INCLUSIVE_EFFECTIVE_PARTITION_KEY,
};
pub use range::{PartitionKeyRange, Range};
pub use routing_map::CollectionRoutingMap;
