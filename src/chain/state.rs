//! Active chain state
//!
//! The active chain from its base (genesis or a checkpoint anchor) to the
//! tip, with the UTXO set and nonce table as of the tip. Blocks enter and
//! leave only through [`ChainState::connect_block`] and
//! [`ChainState::disconnect_tip`]; a failed connect leaves nothing behind.

use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::config::ConsensusParams;
use crate::consensus::{
    calculate_block_reward, calculate_work, expected_difficulty, get_period_start_height,
    should_adjust_difficulty, validate_coinbase, validate_header, validate_merkle_root,
    validate_unique_transactions, Block, BlockMeta, ChainAnchor, ChainWork, ConsensusViolation,
};
use crate::crypto::Hash;
use crate::error::IntegrityError;
use crate::storage::{BlockUndo, Utxo, UtxoError, UtxoSet, UtxoSnapshot, UtxoView};
use crate::validation::{
    validate_transaction, NonceSnapshot, NonceTracker, NonceView, OutPoint, Transaction,
    TxRejection, ValidationRules,
};

/// Clock value used when replaying blocks that already passed the drift check
pub const REPLAY_CLOCK: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct ChainState {
    params: ConsensusParams,
    /// `metas[i]` is the block at `base_height + i`
    metas: Vec<BlockMeta>,
    /// Bodies alongside `metas`; `None` for a checkpoint anchor
    blocks: Vec<Option<Block>>,
    height_of: HashMap<Hash, u64>,
    /// Timestamps of the blocks just below an anchor that still feed a retarget
    prior_timestamps: Vec<u64>,
    /// Confirmed txid -> height
    tx_index: HashMap<Hash, u64>,
    utxos: UtxoSet,
    nonces: NonceTracker,
}

impl ChainState {
    /// Start a chain at `genesis`, applying its outputs unchecked
    pub fn from_genesis(genesis: &Block, params: ConsensusParams) -> Result<Self, UtxoError> {
        let mut utxos = UtxoSet::new();
        let mut tx_index = HashMap::new();
        for tx in &genesis.transactions {
            utxos.apply_transaction(tx, genesis.index())?;
            tx_index.insert(tx.txid(), genesis.index());
        }
        let meta = BlockMeta::of(&genesis.header, calculate_work(genesis.header.difficulty));
        Ok(Self {
            params,
            height_of: HashMap::from([(meta.hash, meta.index)]),
            metas: vec![meta],
            blocks: vec![Some(genesis.clone())],
            prior_timestamps: Vec::new(),
            tx_index,
            utxos,
            nonces: NonceTracker::new(),
        })
    }

    /// Start a chain at a checkpoint whose body is not available
    pub fn from_anchor(
        anchor: ChainAnchor,
        utxos: &UtxoSnapshot,
        nonces: &NonceSnapshot,
        params: ConsensusParams,
    ) -> Result<Self, UtxoError> {
        let ChainAnchor { meta, retarget_window } = anchor;
        let mut state = Self {
            params,
            height_of: HashMap::from([(meta.hash, meta.index)]),
            metas: vec![meta],
            blocks: vec![None],
            prior_timestamps: retarget_window,
            tx_index: HashMap::new(),
            utxos: UtxoSet::new(),
            nonces: NonceTracker::new(),
        };
        state.restore_state(utxos, nonces)?;
        Ok(state)
    }

    /// Append an already-validated block without touching UTXOs or nonces.
    /// Used on startup before [`ChainState::restore_state`] installs the
    /// matching snapshot.
    pub fn attach_history(&mut self, block: Block) -> Result<(), ConsensusViolation> {
        let tip = *self.tip();
        if block.header.previous_hash != tip.hash {
            return Err(ConsensusViolation::InvalidPrevHash {
                expected: tip.hash,
                found: block.header.previous_hash,
            });
        }
        if block.index() != tip.index + 1 {
            return Err(ConsensusViolation::InvalidIndex {
                expected: tip.index + 1,
                found: block.index(),
            });
        }
        let meta = BlockMeta::child(&block.header, tip.work);
        for txid in block.txids() {
            self.tx_index.insert(txid, meta.index);
        }
        self.push(meta, block);
        Ok(())
    }

    /// Replace the UTXO set and nonce table wholesale
    pub fn restore_state(&mut self, utxos: &UtxoSnapshot, nonces: &NonceSnapshot) -> Result<(), UtxoError> {
        self.utxos.restore(utxos)?;
        self.nonces.restore(nonces);
        Ok(())
    }

    fn push(&mut self, meta: BlockMeta, block: Block) {
        self.height_of.insert(meta.hash, meta.index);
        self.metas.push(meta);
        self.blocks.push(Some(block));
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn rules(&self) -> ValidationRules {
        ValidationRules {
            min_fee: self.params.min_fee,
        }
    }

    /// Height of genesis or the anchor
    pub fn base_height(&self) -> u64 {
        self.metas[0].index
    }

    pub fn base(&self) -> &BlockMeta {
        &self.metas[0]
    }

    pub fn is_anchored(&self) -> bool {
        self.blocks[0].is_none()
    }

    pub fn tip(&self) -> &BlockMeta {
        // metas is never empty: both constructors seed the base
        &self.metas[self.metas.len() - 1]
    }

    pub fn height(&self) -> u64 {
        self.tip().index
    }

    pub fn tip_hash(&self) -> Hash {
        self.tip().hash
    }

    pub fn total_work(&self) -> ChainWork {
        self.tip().work
    }

    /// Number of blocks from genesis to tip
    pub fn chain_length(&self) -> u64 {
        self.height() + 1
    }

    fn offset(&self, height: u64) -> Option<usize> {
        let offset = height.checked_sub(self.base_height())? as usize;
        (offset < self.metas.len()).then_some(offset)
    }

    pub fn meta_at(&self, height: u64) -> Option<&BlockMeta> {
        self.offset(height).map(|i| &self.metas[i])
    }

    pub fn block_at(&self, height: u64) -> Option<&Block> {
        self.offset(height).and_then(|i| self.blocks[i].as_ref())
    }

    pub fn height_of(&self, hash: &Hash) -> Option<u64> {
        self.height_of.get(hash).copied()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.height_of.contains_key(hash)
    }

    pub fn meta_by_hash(&self, hash: &Hash) -> Option<&BlockMeta> {
        self.height_of(hash).and_then(|h| self.meta_at(h))
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<&Block> {
        self.height_of(hash).and_then(|h| self.block_at(h))
    }

    /// Hashes of the active blocks strictly above `height`, ascending
    pub fn hashes_above(&self, height: u64) -> Vec<Hash> {
        let start = height.saturating_add(1).max(self.base_height());
        (start..=self.height())
            .filter_map(|h| self.meta_at(h).map(|m| m.hash))
            .collect()
    }

    /// Confirmed transaction and the height of its block
    pub fn find_transaction(&self, txid: &Hash) -> Option<(&Transaction, u64)> {
        let height = *self.tx_index.get(txid)?;
        let tx = self
            .block_at(height)?
            .transactions
            .iter()
            .find(|tx| tx.txid() == *txid)?;
        Some((tx, height))
    }

    pub fn utxos(&self) -> &UtxoSet {
        &self.utxos
    }

    pub fn nonces(&self) -> &NonceTracker {
        &self.nonces
    }

    pub fn total_supply(&self) -> u64 {
        self.utxos.total_supply()
    }

    /// Audit the UTXO running total; mismatches are reported, never fixed
    pub fn check_integrity(&self) -> Result<(), IntegrityError> {
        let report = self.utxos.verify_utxo_consistency();
        if !report.is_consistent() {
            return Err(IntegrityError::UtxoMismatch {
                expected: report.expected,
                actual: report.actual,
            });
        }
        Ok(())
    }

    /// Timestamp of the block at `height`, reaching below an anchor into
    /// the carried retarget window
    fn timestamp_at(&self, height: u64) -> Option<u64> {
        if let Some(meta) = self.meta_at(height) {
            return Some(meta.timestamp);
        }
        let below = self.base_height().checked_sub(height)? as usize;
        let i = self.prior_timestamps.len().checked_sub(below)?;
        self.prior_timestamps.get(i).copied()
    }

    /// Timestamps of the tip's retarget period before the tip, which is
    /// what a chain anchored at the tip needs to retarget like this one
    pub fn retarget_window(&self) -> Vec<u64> {
        let interval = self.params.adjustment_interval;
        if interval == 0 {
            return Vec::new();
        }
        let tip = self.height();
        (tip - tip % interval..tip).filter_map(|h| self.timestamp_at(h)).collect()
    }

    /// Difficulty the next block must declare
    pub fn next_difficulty(&self) -> u32 {
        let height = self.height() + 1;
        let interval = self.params.adjustment_interval;
        let window: Vec<u64> = if should_adjust_difficulty(height, interval) {
            let start = get_period_start_height(height, interval);
            (start..height).filter_map(|h| self.timestamp_at(h)).collect()
        } else {
            Vec::new()
        };
        expected_difficulty(height, self.tip().difficulty, &window, &self.params)
    }

    /// Reward a block at the next height may claim before fees
    pub fn next_reward(&self) -> u64 {
        calculate_block_reward(self.height() + 1, self.total_supply(), &self.params)
    }

    /// Fully validate `block` against the tip and apply it
    ///
    /// Header, merkle root, duplicate transactions, coinbase and every
    /// transfer in order, each against the state left by the ones before
    /// it. On error the state is exactly as it was.
    pub fn connect_block(&mut self, block: &Block, now: u64) -> Result<BlockUndo, ConsensusViolation> {
        let tip = *self.tip();
        validate_header(&block.header, &tip, self.next_difficulty(), now, &self.params)?;
        validate_merkle_root(block)?;
        validate_unique_transactions(block)?;
        for txid in block.txids() {
            if self.tx_index.contains_key(&txid) {
                return Err(ConsensusViolation::DuplicateTransaction { txid });
            }
        }
        validate_coinbase(block, self.next_reward())?;

        let height = block.index();
        let mut undo = BlockUndo::default();
        if let Err(violation) = self.apply_transactions(block, height, &mut undo) {
            self.revert(&undo);
            return Err(violation);
        }

        self.push(BlockMeta::child(&block.header, tip.work), block.clone());
        Ok(undo)
    }

    fn apply_transactions(
        &mut self,
        block: &Block,
        height: u64,
        undo: &mut BlockUndo,
    ) -> Result<(), ConsensusViolation> {
        let rules = self.rules();
        let mut spent_here: HashSet<OutPoint> = HashSet::new();

        for (index, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            if !tx.is_coinbase() {
                let view = ConfirmedView {
                    utxos: &self.utxos,
                    tx_index: &self.tx_index,
                };
                if let Err(reason) = validate_transaction(tx, &view, &self.nonces, &rules) {
                    return Err(match reason {
                        TxRejection::MissingInput(o) | TxRejection::AlreadySpent(o)
                            if spent_here.contains(&o) =>
                        {
                            ConsensusViolation::DoubleSpend(o)
                        }
                        reason => ConsensusViolation::InvalidTransaction { index, reason },
                    });
                }
                let previous = self.nonces.last_nonce(&tx.sender);
                self.nonces
                    .check_and_increment(&tx.sender, tx.nonce)
                    .map_err(|e| ConsensusViolation::InvalidTransaction {
                        index,
                        reason: e.into(),
                    })?;
                undo.nonces.push((tx.sender.clone(), previous));
            }

            let spent = self
                .utxos
                .apply_transaction(tx, height)
                .map_err(|e| ConsensusViolation::UnappliableTransaction {
                    index,
                    reason: e.to_string(),
                })?;
            spent_here.extend(spent.iter().map(|(o, _)| *o));
            undo.spent.extend(spent);
            undo.created.extend(
                tx.outputs
                    .iter()
                    .enumerate()
                    .filter(|(_, o)| o.amount > 0)
                    .map(|(vout, _)| OutPoint::new(txid, vout as u32)),
            );
            undo.txids.push(txid);
            self.tx_index.insert(txid, height);
        }
        Ok(())
    }

    /// Apply an undo record: drop what the block created, restore what it
    /// spent, rewind nonces
    fn revert(&mut self, undo: &BlockUndo) {
        let created: HashSet<OutPoint> = undo.created.iter().copied().collect();
        for outpoint in undo.created.iter().rev() {
            // Outputs spent later in the same block are already gone.
            let _ = self.utxos.spend(&outpoint.txid, outpoint.vout);
        }
        for (outpoint, utxo) in undo.spent.iter().rev() {
            if created.contains(outpoint) {
                continue;
            }
            if let Err(e) = self.utxos.insert(*outpoint, utxo.clone()) {
                warn!(event = "undo restore failed", outpoint = %outpoint, error = %e);
            }
        }
        for (sender, previous) in undo.nonces.iter().rev() {
            self.nonces.rewind(sender, *previous);
        }
        for txid in &undo.txids {
            self.tx_index.remove(txid);
        }
    }

    /// Take the tip off the chain. Returns its body, or `None` when the tip
    /// is the base, which cannot be disconnected.
    pub fn disconnect_tip(&mut self, undo: &BlockUndo) -> Option<Block> {
        if self.metas.len() <= 1 {
            return None;
        }
        let meta = self.metas.pop()?;
        let block = self.blocks.pop().flatten();
        self.height_of.remove(&meta.hash);
        self.revert(undo);
        block
    }
}

/// Confirmed outputs plus the confirmed-transaction index
struct ConfirmedView<'a> {
    utxos: &'a UtxoSet,
    tx_index: &'a HashMap<Hash, u64>,
}

impl UtxoView for ConfirmedView<'_> {
    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.utxos.utxo(outpoint)
    }

    fn is_known_tx(&self, txid: &Hash) -> bool {
        self.tx_index.contains_key(txid)
    }
}

impl UtxoView for ChainState {
    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.utxos.utxo(outpoint)
    }

    fn is_known_tx(&self, txid: &Hash) -> bool {
        self.tx_index.contains_key(txid)
    }
}

impl NonceView for ChainState {
    fn last_nonce(&self, sender: &str) -> u64 {
        self.nonces.last_nonce(sender)
    }
}
