//! The ledger
//!
//! Owns the active chain, side branches, the mempool and checkpoints, and
//! is the only place they are mutated together. Lock order is chain, then
//! forks, then mempool, then checkpoints; any subset may be taken but
//! never out of that order.

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{
    collect_reports, CheckpointError, CheckpointManager, CheckpointMetadata, CheckpointPayload, CheckpointPeer,
    PeerReport, SyncOutcome,
};
use crate::config::NodeConfig;
use crate::consensus::{validate_merkle_root, validate_pow, Block, BlockMeta, ChainWork};
use crate::crypto::{is_valid_address, Hash, MerkleProof};
use crate::error::{ConflictError, IntegrityError, LedgerError, LedgerResult, ReorgError, ValidationError};
use crate::mempool::{Admission, Mempool, MempoolCounts};
use crate::metrics::{self, SharedMetrics};
use crate::mining::{build_template, ArrivalOrder, BlockTemplate, TxSelector, MAX_BLOCK_TRANSACTIONS};
use crate::node::create_genesis_block;
use crate::p2p::{InboundMessage, InvItem, InvType, OutboundMessage, PeerInfo, RejectMessage};
use crate::storage::snapshot::{load_snapshot, write_snapshot};
use crate::storage::{
    BlockUndo, ChainStore, ContractReceipt, DataLayout, SnapshotFile, StorageError, UtxoSnapshot, UtxoView,
    WalRecord, WalStatus,
};
use crate::validation::{
    Amount, NonceSnapshot, OutPoint, Transaction, TxOutput, TxRejection, WireTransaction,
};
use super::fork::ForkManager;
use super::orphan::OrphanCounts;
use super::state::{ChainState, REPLAY_CLOCK};

/// Seconds since the Unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Where an accepted block ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Extended the active chain
    Connected { height: u64 },
    /// Made a side branch heavier than the active chain, which was replaced
    Reorganized { height: u64, depth: u64 },
    /// Stored on a branch that is not (yet) the heaviest
    SideBranch { height: u64 },
    /// Parent unknown; held until it arrives
    Orphaned,
}

/// Comparable summary of node state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub height: u64,
    pub tip_hash: Hash,
    pub utxo_digest: Hash,
    pub orphan_counts: OrphanCounts,
    pub mempool_counts: MempoolCounts,
}

/// Read-only queries for wallets, explorers and APIs
pub trait LedgerView {
    fn get_balance(&self, address: &str) -> Amount;
    fn get_chain_length(&self) -> u64;
    fn get_block_by_index(&self, index: u64) -> Option<Block>;
}

/// Construction overrides
pub struct LedgerOptions {
    /// Genesis to use instead of the network's
    pub genesis: Option<Block>,
    pub metrics: SharedMetrics,
    pub selector: Box<dyn TxSelector>,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            genesis: None,
            metrics: metrics::noop(),
            selector: Box::new(ArrivalOrder),
        }
    }
}

/// Chain state as of a point with a known UTXO set
struct RestorePoint {
    height: u64,
    utxos: UtxoSnapshot,
    nonces: NonceSnapshot,
    source: &'static str,
}

pub struct Ledger {
    config: NodeConfig,
    genesis: Block,
    chain: RwLock<ChainState>,
    forks: Mutex<ForkManager>,
    mempool: Mutex<Mempool>,
    checkpoints: Mutex<CheckpointManager>,
    store: ChainStore,
    layout: Option<DataLayout>,
    metrics: SharedMetrics,
    selector: Box<dyn TxSelector>,
    /// Bumped whenever the tip changes
    tip_generation: AtomicU64,
}

impl Ledger {
    /// Open the ledger under `config.data_dir`
    pub fn open(config: NodeConfig) -> LedgerResult<Self> {
        Self::open_with(config, LedgerOptions::default())
    }

    pub fn open_with(config: NodeConfig, options: LedgerOptions) -> LedgerResult<Self> {
        config.validate()?;
        let layout = DataLayout::new(&config.data_dir);
        layout.ensure()?;
        let store = ChainStore::open(layout.blocks_dir())?;
        Self::assemble(config, store, Some(layout), options)
    }

    /// Ledger backed by a throwaway database and no files
    pub fn temporary(config: NodeConfig) -> LedgerResult<Self> {
        Self::temporary_with(config, LedgerOptions::default())
    }

    pub fn temporary_with(config: NodeConfig, options: LedgerOptions) -> LedgerResult<Self> {
        config.validate()?;
        let store = ChainStore::temporary()?;
        Self::assemble(config, store, None, options)
    }

    fn assemble(
        config: NodeConfig,
        store: ChainStore,
        layout: Option<DataLayout>,
        options: LedgerOptions,
    ) -> LedgerResult<Self> {
        let genesis = options
            .genesis
            .unwrap_or_else(|| create_genesis_block(&config.consensus));
        let checkpoints = CheckpointManager::new(layout.as_ref().map(DataLayout::checkpoints_dir), &config.checkpoint)?;

        recover_wal(&store)?;
        let state = load_state(&config, &genesis, &store, layout.as_ref(), &checkpoints)?;
        info!(
            event = "ledger opened",
            network = ?config.consensus.network,
            height = state.height(),
            tip = %state.tip_hash(),
            base = state.base_height()
        );

        let ledger = Self {
            forks: Mutex::new(ForkManager::new(config.orphans.clone())),
            mempool: Mutex::new(Mempool::new(config.mempool.clone())),
            checkpoints: Mutex::new(checkpoints),
            chain: RwLock::new(state),
            config,
            genesis,
            store,
            layout,
            metrics: options.metrics,
            selector: options.selector,
            tip_generation: AtomicU64::new(0),
        };
        ledger.publish_gauges(&ledger.chain.read(), 0);
        Ok(ledger)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    /// Shared read access to the active chain
    pub fn read_chain(&self) -> RwLockReadGuard<'_, ChainState> {
        self.chain.read()
    }

    pub fn height(&self) -> u64 {
        self.chain.read().height()
    }

    pub fn tip_hash(&self) -> Hash {
        self.chain.read().tip_hash()
    }

    /// Counter bumped on every tip change; miners poll it
    pub fn tip_generation(&self) -> u64 {
        self.tip_generation.load(Ordering::SeqCst)
    }

    pub fn mempool_len(&self) -> usize {
        self.mempool.lock().len()
    }

    pub fn check_integrity(&self) -> LedgerResult<()> {
        Ok(self.chain.read().check_integrity()?)
    }

    fn publish_gauges(&self, chain: &ChainState, mempool_len: usize) {
        self.metrics.set_gauge(metrics::CHAIN_HEIGHT, chain.height() as f64);
        self.metrics.set_gauge(metrics::MEMPOOL_SIZE, mempool_len as f64);
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    pub fn ingest_block(&self, block: Block) -> LedgerResult<BlockStatus> {
        self.ingest_block_at(block, unix_now())
    }

    /// Accept a block from any source
    ///
    /// Extends the tip, lands on a side branch (reorganizing if that branch
    /// is now strictly heavier) or waits in the orphan pool. Orphans whose
    /// parent becomes known are processed right after.
    pub fn ingest_block_at(&self, block: Block, now: u64) -> LedgerResult<BlockStatus> {
        let hash = block.hash();
        if let Err(e) = validate_pow(&block.header).and_then(|_| validate_merkle_root(&block)) {
            self.metrics.incr_counter(metrics::BLOCKS_REJECTED, 1);
            debug!(event = "block rejected", hash = %hash, reason = %e);
            return Err(e.into());
        }

        let mut chain = self.chain.write();
        let mut forks = self.forks.lock();
        if chain.contains(&hash) || forks.contains(&hash) {
            return Err(ConflictError::DuplicateBlock(hash).into());
        }

        let tip_before = chain.tip_hash();
        let mut returned = Vec::new();
        let status = match self.place_block(&mut chain, &mut forks, block, now, &mut returned) {
            Ok(status) => status,
            Err(e) => {
                let counter = match e {
                    LedgerError::Reorg(_) => metrics::REORGS_REJECTED,
                    _ => metrics::BLOCKS_REJECTED,
                };
                self.metrics.incr_counter(counter, 1);
                return Err(e);
            }
        };

        if status != BlockStatus::Orphaned {
            self.adopt_orphans(&mut chain, &mut forks, hash, now, &mut returned);
        }

        if chain.tip_hash() == tip_before {
            return Ok(status);
        }

        self.tip_generation.fetch_add(1, Ordering::SeqCst);
        let horizon = chain.height().saturating_sub(chain.params().max_reorg_depth);
        forks.prune_below(horizon);
        forks.orphans_mut().prune_at_or_below(horizon.max(chain.base_height()));
        drop(forks);

        let mempool_len = {
            let mut mempool = self.mempool.lock();
            let rules = chain.rules();
            let dropped = mempool.reconcile(returned, &*chain, &*chain, &rules, now);
            let expired = self.expire_pending(&mut mempool, now);
            debug!(event = "mempool reconciled", dropped, expired, pending = mempool.len());
            mempool.len()
        };
        self.publish_gauges(&chain, mempool_len);

        let due = self.checkpoints.lock().is_due(chain.height());
        if let Some(copy) = due.then(|| CheckpointCopy::take(&chain)).flatten() {
            drop(chain);
            self.write_checkpoint(copy);
        }
        Ok(status)
    }

    /// Route one block to the tip, a side branch or the orphan pool
    fn place_block(
        &self,
        chain: &mut ChainState,
        forks: &mut ForkManager,
        block: Block,
        now: u64,
        returned: &mut Vec<Transaction>,
    ) -> LedgerResult<BlockStatus> {
        let parent = *block.previous_hash();
        if parent == chain.tip_hash() {
            let height = self.connect_tip(chain, &block, now)?;
            return Ok(BlockStatus::Connected { height });
        }

        if forks.meta_of(chain, &parent).is_some() {
            let meta = forks.add_side_block(chain, block.clone(), now)?;
            self.store.put_block(&block)?;
            if !forks.beats_active(chain, &meta) {
                debug!(event = "side branch extended", height = meta.index, hash = %meta.hash, work = %meta.work);
                return Ok(BlockStatus::SideBranch { height: meta.index });
            }
            let (height, depth, old) = self.reorganize(chain, forks, meta.hash, now)?;
            returned.extend(old);
            return Ok(BlockStatus::Reorganized { height, depth });
        }

        let hash = block.hash();
        let index = block.index();
        if forks.orphans_mut().insert(block) {
            self.metrics.incr_counter(metrics::ORPHAN_BLOCKS, 1);
            debug!(event = "orphan block held", index, hash = %hash, parent = %parent);
        }
        Ok(BlockStatus::Orphaned)
    }

    /// Fully validate and connect a child of the tip, then persist it
    fn connect_tip(&self, chain: &mut ChainState, block: &Block, now: u64) -> LedgerResult<u64> {
        let undo = chain.connect_block(block, now)?;
        let hash = block.hash();
        let height = block.index();
        let persisted = self
            .store
            .put_block(block)
            .and_then(|_| self.store.put_undo(&hash, &undo))
            .and_then(|_| self.store.set_chain_entry(height, &hash));
        if let Err(e) = persisted {
            chain.disconnect_tip(&undo);
            return Err(e.into());
        }
        self.metrics.incr_counter(metrics::BLOCKS_CONNECTED, 1);
        info!(
            event = "block connected",
            height,
            hash = %hash,
            txs = block.transactions.len(),
            difficulty = block.header.difficulty
        );
        Ok(height)
    }

    /// Process orphans descending from `root` now that it is known
    fn adopt_orphans(
        &self,
        chain: &mut ChainState,
        forks: &mut ForkManager,
        root: Hash,
        now: u64,
        returned: &mut Vec<Transaction>,
    ) {
        let mut known = vec![root];
        while let Some(parent) = known.pop() {
            for child in forks.orphans_mut().children_of(&parent) {
                let hash = child.hash();
                match self.place_block(chain, forks, child, now, returned) {
                    Ok(status) => {
                        debug!(event = "orphan adopted", hash = %hash, status = ?status);
                        known.push(hash);
                    }
                    Err(e) => warn!(event = "orphan rejected", hash = %hash, error = %e),
                }
            }
        }
    }

    /// Switch the active chain to the side branch ending at `new_tip`
    ///
    /// Returns the new height, the number of blocks disconnected and the
    /// non-coinbase transactions they carried, oldest first.
    fn reorganize(
        &self,
        chain: &mut ChainState,
        forks: &mut ForkManager,
        new_tip: Hash,
        now: u64,
    ) -> LedgerResult<(u64, u64, Vec<Transaction>)> {
        let branch = forks
            .branch_to(chain, &new_tip)
            .ok_or(ReorgError::Disconnected(new_tip))?;
        let fork_height = branch.fork_height;

        let floor = self.checkpoints.lock().highest_height().max(chain.base_height());
        if fork_height < floor {
            warn!(event = "reorg refused", reason = "below checkpoint", fork_height, floor);
            return Err(ReorgError::BelowCheckpoint {
                fork_height,
                checkpoint_height: floor,
            }
            .into());
        }
        let depth = chain.height() - fork_height;
        let max = chain.params().max_reorg_depth;
        if depth > max {
            warn!(event = "reorg refused", reason = "too deep", depth, max);
            return Err(ReorgError::TooDeep { depth, max }.into());
        }

        let old_hashes = chain.hashes_above(fork_height);
        let new_hashes = branch.hashes();
        let mut undos = Vec::with_capacity(old_hashes.len());
        for hash in old_hashes.iter().rev() {
            let undo = self.store.get_undo(hash)?.ok_or(IntegrityError::MissingUndo(*hash))?;
            undos.push(undo);
        }

        let mut record = WalRecord::new(
            chain.tip_hash(),
            new_tip,
            fork_height,
            old_hashes.clone(),
            new_hashes.clone(),
            now,
        );
        self.store.write_wal(&record)?;

        let mut disconnected: Vec<(Block, BlockMeta)> = Vec::with_capacity(undos.len());
        for undo in &undos {
            let meta = *chain.tip();
            match chain.disconnect_tip(undo) {
                Some(block) => disconnected.push((block, meta)),
                None => break,
            }
        }

        let mut connected: Vec<BlockUndo> = Vec::with_capacity(branch.blocks.len());
        let mut failure = None;
        for block in &branch.blocks {
            match chain.connect_block(block, now) {
                Ok(undo) => connected.push(undo),
                Err(reason) => {
                    failure = Some((block.hash(), reason));
                    break;
                }
            }
        }

        if let Some((bad, reason)) = failure {
            Self::restore_branch(chain, &connected, &disconnected)?;
            let dropped = forks.discard_subtree(&bad);
            self.store.clear_wal()?;
            warn!(event = "reorg aborted", bad = %bad, reason = %reason, dropped);
            return Err(ReorgError::InvalidBranch { hash: bad, reason }.into());
        }

        if let Err(e) = self.commit_branch(&mut record, &new_hashes, &connected) {
            Self::restore_branch(chain, &connected, &disconnected)?;
            let cleanup = self
                .store
                .rewrite_chain(fork_height, &old_hashes)
                .and_then(|()| self.store.clear_wal());
            if let Err(cleanup) = cleanup {
                error!(event = "reorg rollback incomplete", error = %e, cleanup = %cleanup);
                return Err(StorageError::Corrupt(format!(
                    "chain index left mid-reorg at fork height {fork_height}: {cleanup}"
                ))
                .into());
            }
            warn!(event = "reorg rolled back", fork_height, error = %e);
            return Err(e);
        }

        forks.forget(&new_hashes);
        let mut returned = Vec::new();
        for (block, meta) in disconnected.into_iter().rev() {
            returned.extend(block.transactions.iter().filter(|tx| !tx.is_coinbase()).cloned());
            forks.insert_disconnected(block, meta);
        }

        self.metrics.incr_counter(metrics::REORGS, 1);
        self.metrics.incr_counter(metrics::BLOCKS_CONNECTED, new_hashes.len() as u64);
        info!(
            event = "chain reorganized",
            fork_height,
            depth,
            old_tip = %record.old_tip,
            new_tip = %new_tip,
            height = chain.height()
        );
        Ok((chain.height(), depth, returned))
    }

    /// Persist a switched branch: undo records, chain index, then the
    /// committed WAL marker
    fn commit_branch(
        &self,
        record: &mut WalRecord,
        new_hashes: &[Hash],
        connected: &[BlockUndo],
    ) -> LedgerResult<()> {
        for (hash, undo) in new_hashes.iter().zip(connected) {
            self.store.put_undo(hash, undo)?;
        }
        self.store.rewrite_chain(record.fork_height, new_hashes)?;
        record.status = WalStatus::Committed;
        self.store.write_wal(record)?;
        self.store.clear_wal()?;
        Ok(())
    }

    /// Undo a partially or fully connected branch and put the old blocks back
    fn restore_branch(
        chain: &mut ChainState,
        connected: &[BlockUndo],
        disconnected: &[(Block, BlockMeta)],
    ) -> LedgerResult<()> {
        for undo in connected.iter().rev() {
            chain.disconnect_tip(undo);
        }
        for (block, _) in disconnected.iter().rev() {
            if let Err(e) = chain.connect_block(block, REPLAY_CLOCK) {
                error!(event = "old branch restore failed", hash = %block.hash(), error = %e);
                return Err(IntegrityError::InvalidStoredBlock {
                    hash: block.hash(),
                    reason: e,
                }
                .into());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn ingest_transaction(&self, tx: Transaction) -> LedgerResult<Admission> {
        self.ingest_transaction_at(tx, unix_now())
    }

    /// Validate a transaction against the tip and pending state and admit
    /// it to the mempool
    pub fn ingest_transaction_at(&self, tx: Transaction, now: u64) -> LedgerResult<Admission> {
        let chain = self.chain.read();
        let txid = tx.txid();
        if chain.is_known_tx(&txid) {
            self.metrics.incr_counter(metrics::TXS_REJECTED, 1);
            return Err(ConflictError::DuplicateTransaction(txid).into());
        }
        let mut mempool = self.mempool.lock();
        let result = mempool.admit(tx, &*chain, &*chain, &chain.rules(), now);
        match &result {
            Ok(admission) => {
                self.metrics.incr_counter(metrics::TXS_ACCEPTED, 1);
                self.metrics.set_gauge(metrics::MEMPOOL_SIZE, mempool.len() as f64);
                debug!(event = "transaction admitted", txid = %txid, outcome = ?admission);
            }
            Err(e) => {
                self.metrics.incr_counter(metrics::TXS_REJECTED, 1);
                debug!(event = "transaction rejected", txid = %txid, reason = %e);
            }
        }
        Ok(result?)
    }

    pub fn prune_mempool(&self) -> usize {
        self.prune_mempool_at(unix_now())
    }

    /// Drop pending and orphan transactions older than `mempool.max_age`.
    /// Only the mempool lock is taken.
    pub fn prune_mempool_at(&self, now: u64) -> usize {
        let mut mempool = self.mempool.lock();
        let expired = self.expire_pending(&mut mempool, now);
        if expired > 0 {
            self.metrics.set_gauge(metrics::MEMPOOL_SIZE, mempool.len() as f64);
            debug!(event = "mempool swept", expired, pending = mempool.len());
        }
        expired
    }

    fn expire_pending(&self, mempool: &mut Mempool, now: u64) -> usize {
        let expired = mempool.prune_expired(now);
        if expired > 0 {
            self.metrics.incr_counter(metrics::TXS_EXPIRED, expired as u64);
        }
        expired
    }

    /// Accept a transaction in wallet wire format
    pub fn ingest_wire_transaction(&self, wire: WireTransaction) -> LedgerResult<Admission> {
        let tx = Transaction::from_wire(wire).map_err(ValidationError::from)?;
        self.ingest_transaction(tx)
    }

    /// Pending or confirmed transaction, with its confirmation height
    pub fn get_transaction(&self, txid: &Hash) -> Option<(Transaction, Option<u64>)> {
        let chain = self.chain.read();
        if let Some((tx, height)) = chain.find_transaction(txid) {
            return Some((tx.clone(), Some(height)));
        }
        let mempool = self.mempool.lock();
        mempool.get(txid).map(|entry| (entry.tx.clone(), None))
    }

    /// Proof that a confirmed transaction is in its block
    pub fn merkle_proof(&self, txid: &Hash) -> Option<(Hash, MerkleProof)> {
        let chain = self.chain.read();
        let (_, height) = chain.find_transaction(txid)?;
        let block = chain.block_at(height)?;
        Some((block.hash(), block.merkle_proof(txid)?))
    }

    // ------------------------------------------------------------------
    // Mining
    // ------------------------------------------------------------------

    /// Unmined child of the tip filled from the mempool
    pub fn block_template(&self, miner_address: &str, now: u64) -> LedgerResult<BlockTemplate> {
        if !is_valid_address(miner_address) {
            return Err(ValidationError::Transaction(TxRejection::InvalidOutput {
                index: 0,
                reason: "invalid miner address",
            })
            .into());
        }
        let chain = self.chain.read();
        let generation = self.tip_generation();
        let mempool = self.mempool.lock();
        let mut template = build_template(
            &chain,
            mempool.entries_by_arrival(),
            self.selector.as_ref(),
            miner_address,
            MAX_BLOCK_TRANSACTIONS,
            now,
        );
        template.tip_generation = generation;
        Ok(template)
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    fn write_checkpoint(&self, copy: CheckpointCopy) {
        let height = copy.block.index();
        let result = CheckpointPayload::build(
            &copy.block.header,
            copy.utxos.clone(),
            copy.nonces.clone(),
            copy.retarget_window,
            copy.total_supply,
            copy.work,
        )
        .and_then(|mut payload| {
            let mut checkpoints = self.checkpoints.lock();
            checkpoints.sign_if_configured(&mut payload)?;
            checkpoints.record(payload)
        });
        match result {
            Ok(()) => self.metrics.incr_counter(metrics::CHECKPOINTS_CREATED, 1),
            Err(e) => warn!(event = "checkpoint failed", height, error = %e),
        }
        if let Some(layout) = &self.layout {
            let snapshot = SnapshotFile::new(height, copy.block.hash(), copy.utxos, copy.nonces);
            if let Err(e) = write_snapshot(&layout.snapshot_path(), &snapshot) {
                warn!(event = "snapshot write failed", height, error = %e);
            }
        }
    }

    pub fn get_checkpoint_metadata(&self) -> Option<CheckpointMetadata> {
        self.checkpoints.lock().latest_metadata()
    }

    /// Full checkpoint at `height`, or the newest one
    pub fn export_checkpoint_payload(&self, height: Option<u64>) -> LedgerResult<Option<CheckpointPayload>> {
        let checkpoints = self.checkpoints.lock();
        let Some(height) = height.or_else(|| checkpoints.latest_metadata().map(|m| m.height)) else {
            return Ok(None);
        };
        Ok(checkpoints.load(height)?)
    }

    /// Pick the checkpoint enough peers agree on and fast-sync to it when
    /// the local chain is empty or far behind
    pub fn apply_peer_reports(&self, reports: &[PeerReport]) -> LedgerResult<SyncOutcome> {
        let selected = self.checkpoints.lock().select_peer_checkpoint(reports);
        let payload = match selected {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.incr_counter(metrics::CHECKPOINTS_REJECTED, 1);
                return Err(e.into());
            }
        };
        self.install_checkpoint(payload)
    }

    /// Ask every peer for its latest checkpoint and apply what they agree on
    pub async fn sync_from_peers(&self, peers: &[Arc<dyn CheckpointPeer>]) -> LedgerResult<SyncOutcome> {
        let reports = collect_reports(peers, self.config.checkpoint.peer_timeout).await;
        info!(event = "peer checkpoints collected", asked = peers.len(), answered = reports.len());
        self.apply_peer_reports(&reports)
    }

    /// Collect a pushed checkpoint and act once a quorum agrees
    fn receive_peer_checkpoint(&self, peer: &PeerInfo, payload: CheckpointPayload) -> LedgerResult<Option<SyncOutcome>> {
        payload.verify_integrity()?;
        let reports = self.checkpoints.lock().note_peer_report(PeerReport {
            peer_id: peer.id.clone(),
            addr: peer.addr,
            payload,
        });
        match self.apply_peer_reports(&reports) {
            Ok(outcome) => {
                self.checkpoints.lock().clear_peer_reports();
                Ok(Some(outcome))
            }
            Err(LedgerError::Checkpoint(
                CheckpointError::InsufficientPeers { .. } | CheckpointError::InsufficientGroups { .. },
            )) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn install_checkpoint(&self, payload: CheckpointPayload) -> LedgerResult<SyncOutcome> {
        let mut chain = self.chain.write();
        let local = chain.height();
        let lag = self.config.checkpoint.fast_sync_lag;
        let empty = local == 0;
        if payload.height <= local || !(empty || payload.height - local > lag) {
            debug!(event = "peer checkpoint not needed", local, offered = payload.height);
            return Ok(SyncOutcome::UpToDate {
                local,
                offered: payload.height,
            });
        }

        let anchor = payload.anchor(self.config.consensus.adjustment_interval)?;
        let state = ChainState::from_anchor(
            anchor.clone(),
            &payload.data.utxo_snapshot,
            &payload.data.sender_nonces,
            self.config.consensus.clone(),
        )
        .map_err(IntegrityError::from)?;
        self.store.anchor_chain(&anchor)?;
        *chain = state;

        let mut forks = self.forks.lock();
        forks.clear();
        let mut mempool = self.mempool.lock();
        let rules = chain.rules();
        mempool.reconcile(Vec::new(), &*chain, &*chain, &rules, unix_now());
        let mut checkpoints = self.checkpoints.lock();
        checkpoints.record(payload)?;

        self.tip_generation.fetch_add(1, Ordering::SeqCst);
        self.publish_gauges(&chain, mempool.len());
        let anchor = anchor.meta;
        info!(event = "fast synced from checkpoint", height = anchor.index, hash = %anchor.hash, previous = local);
        Ok(SyncOutcome::Applied { height: anchor.index })
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    /// Dispatch a decoded peer message. Returns the replies to send.
    pub fn handle_message(&self, peer: &PeerInfo, message: InboundMessage) -> Vec<OutboundMessage> {
        let command = message.command();
        let reject = |e: &LedgerError, hash: Option<Hash>| {
            debug!(event = "peer message rejected", peer = %peer.id, command, error = %e);
            vec![OutboundMessage::Reject(RejectMessage::new(command, e, hash))]
        };

        match message {
            InboundMessage::Block(block) => {
                let hash = block.hash();
                let parent = *block.previous_hash();
                match self.ingest_block(block) {
                    Ok(BlockStatus::Orphaned) => vec![OutboundMessage::GetData(vec![InvItem::block(parent)])],
                    Ok(_) => Vec::new(),
                    Err(e) => reject(&e, Some(hash)),
                }
            }
            InboundMessage::Transaction(wire) => match self.ingest_wire_transaction(wire) {
                Ok(_) => Vec::new(),
                Err(e) => reject(&e, None),
            },
            InboundMessage::Checkpoint(payload) => {
                let hash = payload.block_hash;
                match self.receive_peer_checkpoint(peer, payload) {
                    Ok(_) => Vec::new(),
                    Err(e) => reject(&e, Some(hash)),
                }
            }
            InboundMessage::GetData(items) => items.iter().filter_map(|item| self.lookup(item)).collect(),
            InboundMessage::Inv(items) => {
                let wanted: Vec<InvItem> = items.into_iter().filter(|item| !self.knows(item)).collect();
                if wanted.is_empty() {
                    Vec::new()
                } else {
                    vec![OutboundMessage::GetData(wanted)]
                }
            }
        }
    }

    fn lookup(&self, item: &InvItem) -> Option<OutboundMessage> {
        match item.inv_type {
            InvType::Block => self.block_by_hash(&item.hash).map(OutboundMessage::Block),
            InvType::Transaction => self
                .get_transaction(&item.hash)
                .map(|(tx, _)| OutboundMessage::Transaction(tx)),
        }
    }

    fn knows(&self, item: &InvItem) -> bool {
        match item.inv_type {
            InvType::Block => self.contains_block(&item.hash),
            InvType::Transaction => {
                let chain = self.chain.read();
                chain.is_known_tx(&item.hash) || {
                    let mempool = self.mempool.lock();
                    mempool.contains(&item.hash) || mempool.is_orphan(&item.hash)
                }
            }
        }
    }

    /// Whether the block is on any branch or waiting as an orphan
    pub fn contains_block(&self, hash: &Hash) -> bool {
        let chain = self.chain.read();
        chain.contains(hash) || self.forks.lock().contains(hash)
    }

    /// Active, side-branch or stored block by hash
    pub fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        {
            let chain = self.chain.read();
            if let Some(block) = chain.block_by_hash(hash) {
                return Some(block.clone());
            }
            if let Some(side) = self.forks.lock().side_block(hash) {
                return Some(side.block.clone());
            }
        }
        self.store.get_block(hash).ok().flatten()
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Summary two nodes can compare for agreement
    pub fn compute_state_snapshot(&self) -> StateSnapshot {
        let chain = self.chain.read();
        let forks = self.forks.lock();
        let mempool = self.mempool.lock();
        StateSnapshot {
            height: chain.height(),
            tip_hash: chain.tip_hash(),
            utxo_digest: chain.utxos().digest(),
            orphan_counts: forks.orphans().counts(),
            mempool_counts: mempool.counts(),
        }
    }

    /// Unspent outputs owned by `address`
    pub fn utxos_for(&self, address: &str) -> Vec<(OutPoint, TxOutput)> {
        self.chain
            .read()
            .utxos()
            .utxos_for(address)
            .into_iter()
            .map(|(outpoint, utxo)| {
                let mut output = TxOutput::new(utxo.address.clone(), utxo.amount);
                output.script = utxo.script.clone();
                (outpoint, output)
            })
            .collect()
    }

    pub fn store_receipts(&self, block_hash: &Hash, receipts: &[ContractReceipt]) -> LedgerResult<()> {
        Ok(self.store.put_receipts(block_hash, receipts)?)
    }

    pub fn receipts(&self, block_hash: &Hash) -> LedgerResult<Vec<ContractReceipt>> {
        Ok(self.store.get_receipts(block_hash)?)
    }

    /// Write the UTXO snapshot file for the current tip
    pub fn save_snapshot(&self) -> LedgerResult<Option<PathBuf>> {
        let Some(layout) = &self.layout else {
            return Ok(None);
        };
        let snapshot = {
            let chain = self.chain.read();
            SnapshotFile::new(
                chain.height(),
                chain.tip_hash(),
                chain.utxos().snapshot(),
                chain.nonces().snapshot(),
            )
        };
        let path = layout.snapshot_path();
        write_snapshot(&path, &snapshot)?;
        self.store.flush()?;
        info!(event = "snapshot saved", height = snapshot.height, path = %path.display());
        Ok(Some(path))
    }

    /// Wipe blocks, snapshots and checkpoints and start again from genesis
    pub fn reset_storage(&self) -> LedgerResult<()> {
        let mut chain = self.chain.write();
        let mut forks = self.forks.lock();
        let mut mempool = self.mempool.lock();
        let mut checkpoints = self.checkpoints.lock();

        self.store.clear()?;
        if let Some(layout) = &self.layout {
            layout.reset_files()?;
        }
        self.store.put_block(&self.genesis)?;
        self.store.set_chain_entry(0, &self.genesis.hash())?;

        *chain = ChainState::from_genesis(&self.genesis, self.config.consensus.clone()).map_err(IntegrityError::from)?;
        forks.clear();
        mempool.clear();
        checkpoints.clear();
        self.tip_generation.fetch_add(1, Ordering::SeqCst);
        self.publish_gauges(&chain, 0);
        warn!(event = "storage reset", genesis = %self.genesis.hash());
        Ok(())
    }
}

impl LedgerView for Ledger {
    fn get_balance(&self, address: &str) -> Amount {
        self.chain.read().utxos().get_balance(address)
    }

    fn get_chain_length(&self) -> u64 {
        self.chain.read().chain_length()
    }

    fn get_block_by_index(&self, index: u64) -> Option<Block> {
        self.chain.read().block_at(index).cloned()
    }
}

/// What a checkpoint needs, copied while the chain lock is held
struct CheckpointCopy {
    block: Block,
    utxos: UtxoSnapshot,
    nonces: NonceSnapshot,
    retarget_window: Vec<u64>,
    total_supply: Amount,
    work: ChainWork,
}

impl CheckpointCopy {
    /// `None` when the tip is an anchor without a body
    fn take(chain: &ChainState) -> Option<Self> {
        Some(Self {
            block: chain.block_at(chain.height())?.clone(),
            utxos: chain.utxos().snapshot(),
            nonces: chain.nonces().snapshot(),
            retarget_window: chain.retarget_window(),
            total_supply: chain.total_supply(),
            work: chain.total_work(),
        })
    }
}

/// Roll back a reorg that never committed, or drop a stale commit marker
fn recover_wal(store: &ChainStore) -> LedgerResult<()> {
    match store.read_wal()? {
        Some(record) if record.is_in_progress() => {
            warn!(
                event = "rolling back interrupted reorg",
                fork_height = record.fork_height,
                old_tip = %record.old_tip,
                new_tip = %record.new_tip
            );
            store.rewrite_chain(record.fork_height, &record.old_branch)?;
            store.clear_wal()?;
        }
        Some(_) => store.clear_wal()?,
        None => {}
    }
    Ok(())
}

/// Rebuild the active chain from storage
///
/// Starts from the newest usable restore point on the stored chain (the
/// UTXO snapshot file or a local checkpoint), attaches the blocks up to it
/// without re-execution and replays the rest with full validation.
fn load_state(
    config: &NodeConfig,
    genesis: &Block,
    store: &ChainStore,
    layout: Option<&DataLayout>,
    checkpoints: &CheckpointManager,
) -> LedgerResult<ChainState> {
    let params = config.consensus.clone();
    let entries = store.chain_entries()?;
    let Some(&(base_height, base_hash)) = entries.first() else {
        store.put_block(genesis)?;
        store.set_chain_entry(0, &genesis.hash())?;
        return Ok(ChainState::from_genesis(genesis, params).map_err(IntegrityError::from)?);
    };
    for (offset, (height, _)) in entries.iter().enumerate() {
        if *height != base_height + offset as u64 {
            return Err(IntegrityError::BrokenChainIndex(*height).into());
        }
    }
    let on_chain = |height: u64, hash: &Hash| {
        height
            .checked_sub(base_height)
            .and_then(|offset| entries.get(offset as usize))
            .is_some_and(|(_, stored)| stored == hash)
    };

    let mut restore: Option<RestorePoint> = None;
    if let Some(layout) = layout {
        match load_snapshot(&layout.snapshot_path()) {
            Ok(Some((snapshot, source))) if on_chain(snapshot.height, &snapshot.tip_hash) => {
                debug!(event = "snapshot usable", height = snapshot.height, ?source);
                restore = Some(RestorePoint {
                    height: snapshot.height,
                    utxos: snapshot.utxos,
                    nonces: snapshot.nonces,
                    source: "snapshot",
                });
            }
            Ok(Some((snapshot, _))) => {
                warn!(event = "snapshot not on stored chain", height = snapshot.height, tip = %snapshot.tip_hash)
            }
            Ok(None) => {}
            Err(e) => warn!(event = "snapshot unusable", error = %e),
        }
    }
    if let Some(payload) = checkpoints.latest_on_chain(|h, hash| on_chain(h, hash)) {
        if restore.as_ref().map_or(true, |r| payload.height > r.height) {
            restore = Some(RestorePoint {
                height: payload.height,
                utxos: payload.data.utxo_snapshot,
                nonces: payload.data.sender_nonces,
                source: "checkpoint",
            });
        }
    }

    let mut state = match store.get_anchor()? {
        Some(anchor) if anchor.meta.hash == base_hash => {
            let point = restore
                .as_ref()
                .filter(|r| r.height >= anchor.meta.index)
                .ok_or(IntegrityError::MissingBlock(anchor.meta.hash))?;
            ChainState::from_anchor(anchor, &point.utxos, &point.nonces, params).map_err(IntegrityError::from)?
        }
        _ => {
            if base_height != 0 || base_hash != genesis.hash() {
                return Err(IntegrityError::BrokenChainIndex(base_height).into());
            }
            ChainState::from_genesis(genesis, params).map_err(IntegrityError::from)?
        }
    };

    let fetch = |hash: &Hash| -> LedgerResult<Block> {
        Ok(store.get_block(hash)?.ok_or(IntegrityError::MissingBlock(*hash))?)
    };

    let mut replay_from = 1;
    if let Some(point) = restore.filter(|r| r.height > base_height || state.is_anchored()) {
        for (_, hash) in &entries[1..=(point.height - base_height) as usize] {
            state.attach_history(fetch(hash)?).map_err(|reason| IntegrityError::InvalidStoredBlock {
                hash: *hash,
                reason,
            })?;
        }
        state
            .restore_state(&point.utxos, &point.nonces)
            .map_err(IntegrityError::from)?;
        info!(event = "state restored", source = point.source, height = point.height);
        replay_from = (point.height - base_height) as usize + 1;
    }

    for (height, hash) in &entries[replay_from..] {
        let block = fetch(hash)?;
        let undo = state
            .connect_block(&block, REPLAY_CLOCK)
            .map_err(|reason| IntegrityError::InvalidStoredBlock { hash: *hash, reason })?;
        store.put_undo(hash, &undo)?;
        debug!(event = "block replayed", height, hash = %hash);
    }
    state.check_integrity()?;
    Ok(state)
}
