/// Shard selection on top of the hash ring
pub mod ring;

use crate::config::ShardingConfig;
use crate::error::ShardisResult;
use crate::utils::extract_hash_tag;

pub use ring::{hash_with, HashRing};

/// Routes shard keys to shards (nodes or replication chains)
#[derive(Debug, Clone)]
pub struct ShardRouter<T> {
    ring: HashRing<T>,
    key_tags: bool,
}

impl<T> ShardRouter<T> {
    pub fn new(shards: Vec<T>, config: &ShardingConfig) -> ShardisResult<Self> {
        Ok(Self {
            ring: HashRing::build(shards, config.virtual_nodes, config.hashing)?,
            key_tags: config.key_tags,
        })
    }

    /// The bytes actually hashed for `key`
    pub fn shard_key<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        if self.key_tags {
            extract_hash_tag(key)
        } else {
            key
        }
    }

    pub fn route_index(&self, key: &[u8]) -> usize {
        self.ring.route_index(self.shard_key(key))
    }

    pub fn route(&self, key: &[u8]) -> &T {
        self.ring.route(self.shard_key(key))
    }

    /// All shards in configuration order
    pub fn all(&self) -> &[T] {
        self.ring.shards()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.ring.shards().get(index)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn ring(&self) -> &HashRing<T> {
        &self.ring
    }
}
