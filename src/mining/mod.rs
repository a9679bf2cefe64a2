//! Block production - templates and the proof-of-work loop

pub mod miner;
pub mod template;

pub use miner::{Miner, MiningResult, CANCEL_CHECK_INTERVAL};
pub use template::{build_template, ArrivalOrder, BlockTemplate, TxSelector, MAX_BLOCK_TRANSACTIONS};
