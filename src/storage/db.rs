//! Database persistence layer using Sled
//!
//! One tree per concern. Block bodies, undo records and receipts are keyed
//! by block hash, the active chain by big-endian height so iteration is in
//! chain order. The WAL lives in its own tree and is flushed on every write.

use serde::{de::DeserializeOwned, Serialize};
use sled::{Batch, Db, Tree};
use std::path::Path;
use thiserror::Error;

use crate::consensus::{Block, ChainAnchor};
use crate::crypto::Hash;
use super::{BlockUndo, ContractReceipt, WalRecord};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("encoding error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

const ANCHOR_KEY: &str = "anchor";
const WAL_KEY: &str = "reorg";

/// Database wrapper
#[derive(Debug, Clone)]
pub struct ChainStore {
    db: Db,
    blocks: Tree,
    chain: Tree,
    undo: Tree,
    receipts: Tree,
    metadata: Tree,
    wal: Tree,
    /// Number of upcoming chain rewrites to fail
    #[cfg(test)]
    rewrite_faults: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl ChainStore {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// Throwaway database, removed when dropped
    pub fn temporary() -> StorageResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            chain: db.open_tree("chain")?,
            undo: db.open_tree("undo")?,
            receipts: db.open_tree("receipts")?,
            metadata: db.open_tree("metadata")?,
            wal: db.open_tree("wal")?,
            db,
            #[cfg(test)]
            rewrite_faults: Default::default(),
        })
    }

    fn get_bincode<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> StorageResult<Option<T>> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_bincode<T: Serialize>(tree: &Tree, key: &[u8], value: &T) -> StorageResult<()> {
        tree.insert(key, bincode::serialize(value)?)?;
        Ok(())
    }

    /// Save a block body
    pub fn put_block(&self, block: &Block) -> StorageResult<()> {
        Self::put_bincode(&self.blocks, &block.hash().0, block)
    }

    /// Get a block by hash
    pub fn get_block(&self, hash: &Hash) -> StorageResult<Option<Block>> {
        Self::get_bincode(&self.blocks, &hash.0)
    }

    pub fn put_undo(&self, hash: &Hash, undo: &BlockUndo) -> StorageResult<()> {
        Self::put_bincode(&self.undo, &hash.0, undo)
    }

    pub fn get_undo(&self, hash: &Hash) -> StorageResult<Option<BlockUndo>> {
        Self::get_bincode(&self.undo, &hash.0)
    }

    pub fn put_receipts(&self, block_hash: &Hash, receipts: &[ContractReceipt]) -> StorageResult<()> {
        Self::put_bincode(&self.receipts, &block_hash.0, &receipts.to_vec())?;
        self.receipts.flush()?;
        Ok(())
    }

    pub fn get_receipts(&self, block_hash: &Hash) -> StorageResult<Vec<ContractReceipt>> {
        Ok(Self::get_bincode(&self.receipts, &block_hash.0)?.unwrap_or_default())
    }

    /// Record `hash` as the active block at `height`
    pub fn set_chain_entry(&self, height: u64, hash: &Hash) -> StorageResult<()> {
        self.chain.insert(height.to_be_bytes(), hash.0.as_ref())?;
        self.chain.flush()?;
        Ok(())
    }

    /// Atomically replace every active entry above `fork_height` with
    /// `branch`, which starts at `fork_height + 1`
    pub fn rewrite_chain(&self, fork_height: u64, branch: &[Hash]) -> StorageResult<()> {
        #[cfg(test)]
        self.take_rewrite_fault()?;
        let mut batch = Batch::default();
        for item in self.chain.range((fork_height + 1).to_be_bytes()..) {
            let (key, _) = item?;
            batch.remove(key);
        }
        for (offset, hash) in branch.iter().enumerate() {
            let height = fork_height + 1 + offset as u64;
            batch.insert(height.to_be_bytes().to_vec(), hash.0.to_vec());
        }
        self.chain.apply_batch(batch)?;
        self.chain.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_rewrites(&self, count: usize) {
        use std::sync::atomic::Ordering;
        self.rewrite_faults.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_rewrite_fault(&self) -> StorageResult<()> {
        use std::sync::atomic::Ordering;
        let pending = self.rewrite_faults.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match pending {
            Ok(_) => Err(std::io::Error::new(std::io::ErrorKind::Other, "injected rewrite failure").into()),
            Err(_) => Ok(()),
        }
    }

    /// Replace the whole chain index with a single anchor entry and record
    /// the anchor. Used when a chain is re-based on a checkpoint.
    pub fn anchor_chain(&self, anchor: &ChainAnchor) -> StorageResult<()> {
        let mut batch = Batch::default();
        for item in self.chain.iter() {
            let (key, _) = item?;
            batch.remove(key);
        }
        batch.insert(anchor.meta.index.to_be_bytes().to_vec(), anchor.meta.hash.0.to_vec());
        self.chain.apply_batch(batch)?;
        self.chain.flush()?;
        self.put_anchor(anchor)
    }

    /// Active chain as `(height, hash)`, ascending
    pub fn chain_entries(&self) -> StorageResult<Vec<(u64, Hash)>> {
        let mut entries = Vec::new();
        for item in self.chain.iter() {
            let (key, value) = item?;
            let height: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::Corrupt("chain index key".into()))?;
            let hash: [u8; 32] = value
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::Corrupt("chain index value".into()))?;
            entries.push((u64::from_be_bytes(height), Hash(hash)));
        }
        Ok(entries)
    }

    /// Checkpoint the chain was fast-synced from, if any
    pub fn put_anchor(&self, anchor: &ChainAnchor) -> StorageResult<()> {
        Self::put_bincode(&self.metadata, ANCHOR_KEY.as_bytes(), anchor)?;
        self.metadata.flush()?;
        Ok(())
    }

    pub fn get_anchor(&self) -> StorageResult<Option<ChainAnchor>> {
        Self::get_bincode(&self.metadata, ANCHOR_KEY.as_bytes())
    }

    /// Durably record a reorg intent or commit marker
    pub fn write_wal(&self, record: &WalRecord) -> StorageResult<()> {
        self.wal.insert(WAL_KEY, serde_json::to_vec(record)?)?;
        self.wal.flush()?;
        Ok(())
    }

    pub fn read_wal(&self) -> StorageResult<Option<WalRecord>> {
        match self.wal.get(WAL_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn clear_wal(&self) -> StorageResult<()> {
        self.wal.remove(WAL_KEY)?;
        self.wal.flush()?;
        Ok(())
    }

    /// Drop every record in every tree
    pub fn clear(&self) -> StorageResult<()> {
        for tree in [&self.blocks, &self.chain, &self.undo, &self.receipts, &self.metadata, &self.wal] {
            tree.clear()?;
        }
        self.flush()
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
