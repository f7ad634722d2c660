/// Consistent hash ring with virtual nodes
use fnv::FnvHasher;
use std::collections::BTreeMap;
use std::hash::Hasher;
use tracing::debug;

use crate::config::HashAlgorithm;
use crate::error::{ShardisError, ShardisResult};

/// Hash `data` onto the 64-bit ring
pub fn hash_with(algorithm: HashAlgorithm, data: &[u8]) -> u64 {
    match algorithm {
        HashAlgorithm::Md5 => {
            let digest = md5::compute(data).0;
            u64::from_be_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ])
        }
        HashAlgorithm::Fnv1a => {
            let mut hasher = FnvHasher::default();
            hasher.write(data);
            hasher.finish()
        }
    }
}

/// Immutable mapping from hashed keys to shards
#[derive(Debug, Clone)]
pub struct HashRing<T> {
    shards: Vec<T>,
    points: BTreeMap<u64, usize>,
    virtual_nodes: usize,
    hashing: HashAlgorithm,
}

impl<T> HashRing<T> {
    /// Place `virtual_nodes` points per shard, labelled `SHARD-{i}-NODE-{v}`.
    /// On an exact collision the later shard owns the point.
    pub fn build(shards: Vec<T>, virtual_nodes: usize, hashing: HashAlgorithm) -> ShardisResult<Self> {
        if shards.is_empty() {
            return Err(ShardisError::routing("cannot build a hash ring without shards"));
        }
        if virtual_nodes == 0 {
            return Err(ShardisError::routing("virtual_nodes must be at least 1"));
        }

        let mut points = BTreeMap::new();
        for index in 0..shards.len() {
            for virtual_index in 0..virtual_nodes {
                let label = format!("SHARD-{}-NODE-{}", index, virtual_index);
                points.insert(hash_with(hashing, label.as_bytes()), index);
            }
        }

        debug!(
            shards = shards.len(),
            points = points.len(),
            ?hashing,
            "Built hash ring"
        );
        Ok(Self {
            shards,
            points,
            virtual_nodes,
            hashing,
        })
    }

    /// Index of the shard owning `key`: the first point at or after its hash,
    /// wrapping to the lowest point past the top of the ring
    pub fn route_index(&self, key: &[u8]) -> usize {
        let hash = self.hash(key);
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, index)| *index)
            .unwrap_or(0)
    }

    pub fn route(&self, key: &[u8]) -> &T {
        &self.shards[self.route_index(key)]
    }

    /// Shards in configuration order
    pub fn shards(&self) -> &[T] {
        &self.shards
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Distinct points on the ring (fewer than shards × virtual nodes after collisions)
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn hash(&self, key: &[u8]) -> u64 {
        hash_with(self.hashing, key)
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    pub fn hashing(&self) -> HashAlgorithm {
        self.hashing
    }
}
