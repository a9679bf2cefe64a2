//! Smart-contract receipts
//!
//! Produced by the contract engine, stored next to the block that confirmed
//! the transactions and never interpreted here.

use serde::{Deserialize, Serialize};

use crate::crypto::Hash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractReceipt {
    pub txid: Hash,
    pub contract: String,
    pub success: bool,
    pub gas_used: u64,
    #[serde(default)]
    pub logs: Vec<String>,
}
