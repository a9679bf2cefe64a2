//! Ledger Core Library
//!
//! Consensus and state engine for a proof-of-work UTXO ledger: block and
//! header validation, difficulty retargeting, UTXO mutation, mempool
//! admission, fork choice with crash-safe reorganization, and checkpoints.
//!
//! Networking, wallets, contract execution and API surfaces are external
//! collaborators; they hand already-decoded data to [`chain::Ledger`].

pub mod config;
pub mod error;
pub mod metrics;
pub mod consensus;
pub mod crypto;
pub mod validation;
pub mod storage;
pub mod mempool;
pub mod chain;
pub mod checkpoint;
pub mod p2p;
pub mod mining;
pub mod node;

pub use chain::{Ledger, LedgerView};
pub use error::{LedgerError, LedgerResult};

/// Protocol constants shared by every network
pub mod constants {
    /// Base units per coin (8 decimal places)
    pub const COIN: u64 = 100_000_000;

    /// Number of decimal places
    pub const DECIMAL_PLACES: u8 = 8;

    /// Address prefix (short chain identifier)
    pub const ADDRESS_PREFIX: &str = "LX";

    /// Sender marker carried by coinbase transactions
    pub const COINBASE_SENDER: &str = "coinbase";

    /// Maximum script length in hex characters
    pub const MAX_SCRIPT_LEN: usize = 10_000;

    /// Highest difficulty (leading zero bits) a header may declare
    pub const MAX_DIFFICULTY: u32 = 120;
}
