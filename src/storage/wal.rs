//! Reorganization write-ahead log record
//!
//! Written before the first mutation of a reorg, marked committed once the
//! new chain index is durable, then deleted. A record still `InProgress` at
//! startup means the reorg never finished and the old branch is restored.

use serde::{Deserialize, Serialize};

use crate::crypto::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalStatus {
    InProgress,
    Committed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub old_tip: Hash,
    pub new_tip: Hash,
    /// Height of the last block both branches share
    pub fork_height: u64,
    /// Active blocks above the fork point before the reorg, ascending
    pub old_branch: Vec<Hash>,
    /// Blocks above the fork point after the reorg, ascending
    pub new_branch: Vec<Hash>,
    pub status: WalStatus,
    pub started_at: u64,
}

impl WalRecord {
    pub fn new(
        old_tip: Hash,
        new_tip: Hash,
        fork_height: u64,
        old_branch: Vec<Hash>,
        new_branch: Vec<Hash>,
        started_at: u64,
    ) -> Self {
        Self {
            old_tip,
            new_tip,
            fork_height,
            old_branch,
            new_branch,
            status: WalStatus::InProgress,
            started_at,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == WalStatus::InProgress
    }
}
