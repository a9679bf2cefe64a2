//! Orphan block pool
//!
//! Blocks whose parent has not arrived yet, grouped by index. Bounded per
//! index and in total; when over capacity the lowest index goes first, and
//! within an index the oldest arrival.
//!
//! Blocks of a branch being reorganized onto live with the fork manager's
//! side blocks, never here, and the pool is only touched under the forks
//! lock, so a reorg and the adoption of its waiting descendants can never
//! see an eviction.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::config::OrphanConfig;
use crate::consensus::Block;
use crate::crypto::Hash;

#[derive(Debug, Clone)]
struct OrphanBlock {
    block: Block,
    hash: Hash,
    arrival: u64,
}

/// Sizes reported in state snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanCounts {
    pub blocks: usize,
    pub indices: usize,
    pub evicted_total: u64,
}

#[derive(Debug)]
pub struct OrphanPool {
    by_index: BTreeMap<u64, Vec<OrphanBlock>>,
    hashes: HashSet<Hash>,
    config: OrphanConfig,
    next_arrival: u64,
    evicted_total: u64,
}

impl OrphanPool {
    pub fn new(config: OrphanConfig) -> Self {
        Self {
            by_index: BTreeMap::new(),
            hashes: HashSet::new(),
            config,
            next_arrival: 0,
            evicted_total: 0,
        }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.hashes.contains(hash)
    }

    /// Hold a parentless block. Returns false if it was already held.
    pub fn insert(&mut self, block: Block) -> bool {
        let hash = block.hash();
        if !self.hashes.insert(hash) {
            return false;
        }
        let index = block.index();
        let arrival = self.next_arrival;
        self.next_arrival += 1;

        let per_index = self.config.per_index;
        let bucket = self.by_index.entry(index).or_default();
        bucket.push(OrphanBlock { block, hash, arrival });
        // buckets stay in arrival order, so the front is the oldest
        while bucket.len() > per_index {
            let evicted = bucket.remove(0);
            self.hashes.remove(&evicted.hash);
            self.evicted_total += 1;
        }
        self.enforce_capacity();
        true
    }

    fn enforce_capacity(&mut self) {
        while self.hashes.len() > self.config.capacity {
            let victim = self.by_index.iter().find_map(|(index, bucket)| {
                bucket.iter().min_by_key(|o| o.arrival).map(|o| (*index, o.hash))
            });
            let Some((index, hash)) = victim else { break };
            self.remove(index, &hash);
            self.evicted_total += 1;
        }
    }

    fn remove(&mut self, index: u64, hash: &Hash) -> Option<Block> {
        let bucket = self.by_index.get_mut(&index)?;
        let position = bucket.iter().position(|o| o.hash == *hash)?;
        let orphan = bucket.remove(position);
        if bucket.is_empty() {
            self.by_index.remove(&index);
        }
        self.hashes.remove(hash);
        Some(orphan.block)
    }

    /// Remove and return every block whose parent is `parent`, oldest first
    pub fn children_of(&mut self, parent: &Hash) -> Vec<Block> {
        let mut found: Vec<(u64, u64, Hash)> = self
            .by_index
            .iter()
            .flat_map(move |(index, bucket)| {
                bucket
                    .iter()
                    .filter(move |o| o.block.previous_hash() == parent)
                    .map(move |o| (o.arrival, *index, o.hash))
            })
            .collect();
        found.sort();
        found
            .into_iter()
            .filter_map(|(_, index, hash)| self.remove(index, &hash))
            .collect()
    }

    /// Forget anything at or below `height`; it can no longer attach
    pub fn prune_at_or_below(&mut self, height: u64) -> usize {
        let stale: Vec<u64> = self.by_index.range(..=height).map(|(index, _)| *index).collect();
        let mut removed = 0;
        for index in stale {
            if let Some(bucket) = self.by_index.remove(&index) {
                for orphan in bucket {
                    self.hashes.remove(&orphan.hash);
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_index.clear();
        self.hashes.clear();
    }

    pub fn counts(&self) -> OrphanCounts {
        OrphanCounts {
            blocks: self.hashes.len(),
            indices: self.by_index.len(),
            evicted_total: self.evicted_total,
        }
    }
}
