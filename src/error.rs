//! Ledger error taxonomy
//!
//! Module errors compose into [`LedgerError`]. Every rejection leaves state
//! untouched; only [`LedgerError::is_fatal`] errors should stop the node.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::consensus::ConsensusViolation;
use crate::crypto::Hash;
use crate::mempool::MempoolError;
use crate::storage::{StorageError, UtxoError};
use crate::validation::{NonceError, OutPoint, TxRejection, WireError};

/// Input that is malformed or breaks a rule on its own
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Transaction(TxRejection),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("malformed message: {0}")]
    Message(#[from] serde_json::Error),
    #[error("mempool full ({0} entries)")]
    MempoolFull(usize),
    #[error("message of {size} bytes exceeds {max}")]
    Oversized { size: usize, max: usize },
}

/// Input that collides with something already accepted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("output {outpoint} already spent by pending {existing}")]
    MempoolDoubleSpend { outpoint: OutPoint, existing: Hash },
    #[error("input {0} already spent")]
    AlreadySpent(OutPoint),
    #[error(transparent)]
    Replay(NonceError),
    #[error("transaction {0} already known")]
    DuplicateTransaction(Hash),
    #[error("block {0} already known")]
    DuplicateBlock(Hash),
}

/// State that disagrees with itself
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("utxo total {actual} does not match running total {expected}")]
    UtxoMismatch { expected: u128, actual: u128 },
    #[error("block {0} missing from storage")]
    MissingBlock(Hash),
    #[error("undo record for {0} missing")]
    MissingUndo(Hash),
    #[error("chain index broken at height {0}")]
    BrokenChainIndex(u64),
    #[error("stored block {hash} no longer validates: {reason}")]
    InvalidStoredBlock { hash: Hash, reason: ConsensusViolation },
    #[error(transparent)]
    Utxo(#[from] UtxoError),
}

/// Reorganizations that were refused or failed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReorgError {
    #[error("fork at {fork_height} is below checkpoint {checkpoint_height}")]
    BelowCheckpoint { fork_height: u64, checkpoint_height: u64 },
    #[error("reorg depth {depth} exceeds limit {max}")]
    TooDeep { depth: u64, max: u64 },
    #[error("branch block {hash} rejected: {reason}")]
    InvalidBranch { hash: Hash, reason: ConsensusViolation },
    #[error("side branch from {0} does not reach the active chain")]
    Disconnected(Hash),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("consensus: {0}")]
    Consensus(#[from] ConsensusViolation),
    #[error("conflict: {0}")]
    Conflict(#[from] ConflictError),
    #[error("integrity: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("reorg: {0}")]
    Reorg(#[from] ReorgError),
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    /// Whether the node cannot continue safely
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::Integrity(_) | LedgerError::Storage(StorageError::Corrupt(_)) | LedgerError::Config(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}

impl From<TxRejection> for LedgerError {
    fn from(reason: TxRejection) -> Self {
        match reason {
            TxRejection::AlreadySpent(outpoint) => ConflictError::AlreadySpent(outpoint).into(),
            TxRejection::Nonce(e @ NonceError::Replay { .. }) => ConflictError::Replay(e).into(),
            other => ValidationError::Transaction(other).into(),
        }
    }
}

impl From<MempoolError> for LedgerError {
    fn from(e: MempoolError) -> Self {
        match e {
            MempoolError::Duplicate(txid) => ConflictError::DuplicateTransaction(txid).into(),
            MempoolError::Full(n) => ValidationError::MempoolFull(n).into(),
            MempoolError::DoubleSpend { outpoint, existing } => {
                ConflictError::MempoolDoubleSpend { outpoint, existing }.into()
            }
            MempoolError::Rejected(reason) => reason.into(),
        }
    }
}
