//! Consistent hash ring over named nodes.
//!
//! Every node owns `total / nodes` virtual partitions, the first
//! `total % nodes` nodes one more. A node's first virtual partition is the
//! hash of its name hash; each further one re-hashes the previous hash.
//! Virtual partitions are ordered by their raw hash bytes.

use crate::error::RoutingError;
use crate::murmur::{murmur3_128, murmur3_32};
use std::cmp::Ordering;

/// Produces the byte hashes that place keys and nodes on the ring.
pub trait HashGenerator: Send + Sync {
    fn compute_hash(&self, data: &[u8]) -> Vec<u8>;
}

/// MurmurHash3 x64 128-bit, little-endian `h1` then `h2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3HashGenerator;

impl HashGenerator for Murmur3HashGenerator {
    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        murmur3_128(data, 0).to_le_bytes().to_vec()
    }
}

impl<G: HashGenerator + ?Sized> HashGenerator for &G {
    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        (**self).compute_hash(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VirtualPartition {
    hash: Vec<u8>,
    node: String,
}

impl Ord for VirtualPartition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for VirtualPartition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Stable hash of a node name.
fn node_name_hash(node: &str) -> [u8; 4] {
    murmur3_32(node.as_bytes(), 0).to_le_bytes()
}

pub struct ConsistentHashRing<G = Murmur3HashGenerator> {
    generator: G,
    partitions: Vec<VirtualPartition>,
    node_count: usize,
}

impl<G: HashGenerator> ConsistentHashRing<G> {
    /// Builds a ring of `total_partitions` virtual partitions. Duplicate node
    /// names are collapsed; the remainder goes to the earliest nodes.
    pub fn new<I, S>(generator: G, nodes: I, total_partitions: usize) -> Result<Self, RoutingError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut distinct: Vec<String> = Vec::new();
        for node in nodes {
            let node = node.into();
            if !distinct.contains(&node) {
                distinct.push(node);
            }
        }
        if distinct.is_empty() || total_partitions == 0 {
            return Err(RoutingError::EmptyRing);
        }

        let per_node = total_partitions / distinct.len();
        let mut extra = total_partitions - per_node * distinct.len();
        let mut partitions = Vec::with_capacity(total_partitions);

        for node in &distinct {
            let count = per_node + usize::from(extra > 0);
            extra = extra.saturating_sub(1);

            let mut hash = generator.compute_hash(&node_name_hash(node));
            for _ in 0..count {
                let next = generator.compute_hash(&hash);
                partitions.push(VirtualPartition {
                    hash,
                    node: node.clone(),
                });
                hash = next;
            }
        }
        partitions.sort();

        tracing::debug!(
            nodes = distinct.len(),
            partitions = partitions.len(),
            "built consistent hash ring"
        );

        Ok(Self {
            generator,
            partitions,
            node_count: distinct.len(),
        })
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Index of the first virtual partition at or after the key's hash,
    /// wrapping to 0 past the end.
    pub fn get_partition(&self, key: &[u8]) -> usize {
        let hash = self.generator.compute_hash(key);
        let index = self
            .partitions
            .partition_point(|p| p.hash.as_slice() < hash.as_slice());
        if index == self.partitions.len() {
            0
        } else {
            index
        }
    }

    /// Node owning `replica` (0 = primary) for the virtual partition at
    /// `partition`, walking forward past repeats of already chosen nodes.
    pub fn get_node_for_partition(
        &self,
        partition: usize,
        replica: usize,
    ) -> Result<&str, RoutingError> {
        let len = self.partitions.len();
        let mut seen: Vec<&str> = Vec::with_capacity(replica + 1);
        for offset in 0..len {
            let node = self.partitions[(partition + offset) % len].node.as_str();
            if seen.contains(&node) {
                continue;
            }
            if seen.len() == replica {
                return Ok(node);
            }
            seen.push(node);
        }
        Err(RoutingError::InsufficientNodes {
            requested: replica + 1,
            available: seen.len(),
        })
    }

    /// Node owning `replica` for `key`.
    pub fn get_node(&self, key: &[u8], replica: usize) -> Result<&str, RoutingError> {
        self.get_node_for_partition(self.get_partition(key), replica)
    }
}
