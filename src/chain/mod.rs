//! Chain module - active chain state, side branches, orphans and the ledger
//! that ties them to the mempool and storage

mod orphan;
mod state;
mod fork;
mod ledger;
#[cfg(test)]
pub(crate) mod testutil;

pub use orphan::{OrphanCounts, OrphanPool};
pub use state::{ChainState, REPLAY_CLOCK};
pub use fork::{Branch, ForkManager, SideBlock};
pub use ledger::{unix_now, BlockStatus, Ledger, LedgerOptions, LedgerView, StateSnapshot};
