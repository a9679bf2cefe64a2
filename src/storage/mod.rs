//! Storage module - UTXO set, undo records and on-disk persistence

mod utxo;
mod undo;
mod wal;
mod receipt;
pub mod db;
pub mod layout;
pub mod snapshot;

pub use utxo::*;
pub use undo::BlockUndo;
pub use wal::{WalRecord, WalStatus};
pub use receipt::ContractReceipt;
pub use db::{ChainStore, StorageError, StorageResult};
pub use layout::DataLayout;
pub use snapshot::{SnapshotFile, SnapshotSource};
