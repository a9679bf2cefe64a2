//! Side branches and fork choice
//!
//! Blocks that attach somewhere other than the tip are kept here with
//! header-level checks only. Full validation happens when a reorg connects
//! them. The heaviest chain wins; on equal work the active chain stays.

use std::collections::HashMap;
use tracing::debug;

use crate::config::{ConsensusParams, OrphanConfig};
use crate::consensus::{validate_merkle_root, validate_pow, Block, BlockMeta, ConsensusViolation};
use crate::crypto::Hash;
use super::orphan::OrphanPool;
use super::state::ChainState;

/// A side-branch block and its position
#[derive(Debug, Clone)]
pub struct SideBlock {
    pub block: Block,
    pub meta: BlockMeta,
}

/// A candidate branch from the active chain to a side tip
#[derive(Debug, Clone)]
pub struct Branch {
    /// Height of the last block shared with the active chain
    pub fork_height: u64,
    /// Blocks above the fork point, ascending
    pub blocks: Vec<Block>,
}

impl Branch {
    pub fn hashes(&self) -> Vec<Hash> {
        self.blocks.iter().map(Block::hash).collect()
    }
}

#[derive(Debug)]
pub struct ForkManager {
    side: HashMap<Hash, SideBlock>,
    orphans: OrphanPool,
}

impl ForkManager {
    pub fn new(orphans: OrphanConfig) -> Self {
        Self {
            side: HashMap::new(),
            orphans: OrphanPool::new(orphans),
        }
    }

    pub fn orphans(&self) -> &OrphanPool {
        &self.orphans
    }

    pub fn orphans_mut(&mut self) -> &mut OrphanPool {
        &mut self.orphans
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.side.contains_key(hash) || self.orphans.contains(hash)
    }

    pub fn side_block(&self, hash: &Hash) -> Option<&SideBlock> {
        self.side.get(hash)
    }

    pub fn side_len(&self) -> usize {
        self.side.len()
    }

    /// Position of `hash` on the active chain or any side branch
    pub fn meta_of<'a>(&'a self, state: &'a ChainState, hash: &Hash) -> Option<&'a BlockMeta> {
        state.meta_by_hash(hash).or_else(|| self.side.get(hash).map(|s| &s.meta))
    }

    /// Store a block whose parent is known but is not the tip
    ///
    /// Checks linkage, index, timestamp bounds, proof of work against the
    /// declared difficulty and the merkle root. Returns the block's meta.
    pub fn add_side_block(
        &mut self,
        state: &ChainState,
        block: Block,
        now: u64,
    ) -> Result<BlockMeta, ConsensusViolation> {
        let parent = *self
            .meta_of(state, block.previous_hash())
            .ok_or(ConsensusViolation::UnknownParent)?;
        check_side_header(&block, &parent, now, state.params())?;

        let meta = BlockMeta::child(&block.header, parent.work);
        debug!(event = "side block stored", height = meta.index, hash = %meta.hash, work = %meta.work);
        self.side.insert(meta.hash, SideBlock { block, meta });
        Ok(meta)
    }

    /// Keep a block that has just left the active chain
    pub fn insert_disconnected(&mut self, block: Block, meta: BlockMeta) {
        self.side.insert(meta.hash, SideBlock { block, meta });
    }

    /// Walk back from `tip` to the active chain
    pub fn branch_to(&self, state: &ChainState, tip: &Hash) -> Option<Branch> {
        let mut blocks = Vec::new();
        let mut cursor = *tip;
        loop {
            if let Some(height) = state.height_of(&cursor) {
                blocks.reverse();
                return Some(Branch { fork_height: height, blocks });
            }
            let side = self.side.get(&cursor)?;
            blocks.push(side.block.clone());
            cursor = *side.block.previous_hash();
        }
    }

    /// Whether a side tip carries strictly more work than the active tip
    pub fn beats_active(&self, state: &ChainState, candidate: &BlockMeta) -> bool {
        candidate.work > state.total_work()
    }

    /// Drop side blocks now on the active chain
    pub fn forget<'a, I: IntoIterator<Item = &'a Hash>>(&mut self, hashes: I) {
        for hash in hashes {
            self.side.remove(hash);
        }
    }

    /// Drop a rejected side block and everything built on it
    pub fn discard_subtree(&mut self, root: &Hash) -> usize {
        let mut doomed = vec![*root];
        let mut removed = 0;
        while let Some(hash) = doomed.pop() {
            if self.side.remove(&hash).is_some() {
                removed += 1;
            }
            doomed.extend(
                self.side
                    .values()
                    .filter(|s| s.block.previous_hash() == &hash)
                    .map(|s| s.meta.hash),
            );
        }
        removed
    }

    /// Forget side blocks that could only win through a reorg deeper than
    /// allowed
    pub fn prune_below(&mut self, height: u64) -> usize {
        let before = self.side.len();
        self.side.retain(|_, s| s.meta.index > height);
        before - self.side.len()
    }

    pub fn clear(&mut self) {
        self.side.clear();
        self.orphans.clear();
    }
}

fn check_side_header(
    block: &Block,
    parent: &BlockMeta,
    now: u64,
    params: &ConsensusParams,
) -> Result<(), ConsensusViolation> {
    if block.index() != parent.index + 1 {
        return Err(ConsensusViolation::InvalidIndex {
            expected: parent.index + 1,
            found: block.index(),
        });
    }
    if block.header.timestamp < parent.timestamp {
        return Err(ConsensusViolation::TimestampBeforeParent {
            parent: parent.timestamp,
            found: block.header.timestamp,
        });
    }
    let limit = now.saturating_add(params.max_future_drift);
    if block.header.timestamp > limit {
        return Err(ConsensusViolation::TimestampInFuture {
            limit,
            found: block.header.timestamp,
        });
    }
    validate_pow(&block.header)?;
    validate_merkle_root(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::state::REPLAY_CLOCK;
    use crate::chain::testutil::Harness;

    fn manager() -> ForkManager {
        ForkManager::new(OrphanConfig::default())
    }

    #[test]
    fn test_branch_walks_to_fork_point() {
        let h = Harness::new(100);
        let mut state = h.state();
        let b1 = h.next_block(&state, vec![]);
        state.connect_block(&b1, REPLAY_CLOCK).unwrap();
        let b2 = h.next_block(&state, vec![]);
        state.connect_block(&b2, REPLAY_CLOCK).unwrap();

        let mut forks = manager();
        let s2 = h.block_on(b1.hash(), 1, b1.header.timestamp, 1, 100, vec![], 7);
        let m2 = forks.add_side_block(&state, s2.clone(), REPLAY_CLOCK).unwrap();
        assert!(!forks.beats_active(&state, &m2));

        let s3 = h.block_on(s2.hash(), 2, s2.header.timestamp, 1, 100, vec![], 7);
        let m3 = forks.add_side_block(&state, s3.clone(), REPLAY_CLOCK).unwrap();
        assert!(forks.beats_active(&state, &m3));

        let branch = forks.branch_to(&state, &s3.hash()).unwrap();
        assert_eq!(branch.fork_height, 1);
        assert_eq!(branch.hashes(), vec![s2.hash(), s3.hash()]);
    }

    #[test]
    fn test_side_block_needs_known_parent() {
        let h = Harness::new(100);
        let state = h.state();
        let mut forks = manager();
        let stray = h.block_on(Hash::zero(), 4, 0, 1, 100, vec![], 0);
        assert_eq!(
            forks.add_side_block(&state, stray, REPLAY_CLOCK),
            Err(ConsensusViolation::UnknownParent)
        );
    }

    #[test]
    fn test_side_block_bad_merkle_rejected() {
        let h = Harness::new(100);
        let state = h.state();
        let mut forks = manager();
        let mut block = h.next_block(&state, vec![]);
        block.transactions.clear();
        assert!(forks.add_side_block(&state, block, REPLAY_CLOCK).is_err());
        assert_eq!(forks.side_len(), 0);
    }

    #[test]
    fn test_discard_subtree() {
        let h = Harness::new(100);
        let state = h.state();
        let mut forks = manager();
        let a = h.block_on(state.tip_hash(), 0, 1_000, 1, 100, vec![], 1);
        let b = h.block_on(a.hash(), 1, a.header.timestamp, 1, 100, vec![], 1);
        let c = h.block_on(state.tip_hash(), 0, 1_000, 1, 100, vec![], 2);
        for block in [a.clone(), b, c] {
            forks.add_side_block(&state, block, REPLAY_CLOCK).unwrap();
        }
        assert_eq!(forks.discard_subtree(&a.hash()), 2);
        assert_eq!(forks.side_len(), 1);
    }
}
