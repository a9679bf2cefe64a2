//! Block undo records
//!
//! Everything needed to take a connected block back off the chain without
//! re-deriving state from history.

use serde::{Deserialize, Serialize};

use crate::crypto::Hash;
use crate::validation::OutPoint;
use super::Utxo;

/// Inverse of one connected block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    /// Outputs the block spent, in spend order
    pub spent: Vec<(OutPoint, Utxo)>,
    /// Outputs the block created
    pub created: Vec<OutPoint>,
    /// `(sender, last nonce before the block)`, in application order
    pub nonces: Vec<(String, u64)>,
    /// Transactions the block confirmed
    pub txids: Vec<Hash>,
}

impl BlockUndo {
    pub fn is_empty(&self) -> bool {
        self.spent.is_empty() && self.created.is_empty() && self.nonces.is_empty() && self.txids.is_empty()
    }
}
