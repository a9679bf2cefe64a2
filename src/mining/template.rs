//! Block templates
//!
//! Pending transactions are offered in the order a [`TxSelector`] picks and
//! re-validated against a scratch view of the tip, so a template never
//! contains a conflicting or out-of-order transaction even when the mempool
//! is stale.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::chain::ChainState;
use crate::consensus::Block;
use crate::crypto::Hash;
use crate::mempool::MempoolEntry;
use crate::storage::{Utxo, UtxoView};
use crate::validation::{
    validate_transaction, Amount, LayeredNonces, NonceTracker, OutPoint, Transaction,
};

/// Most non-coinbase transactions a template takes
pub const MAX_BLOCK_TRANSACTIONS: usize = 2_000;

/// Chooses the order pending transactions are offered to a template
pub trait TxSelector: Send + Sync {
    fn order<'a>(&self, pending: Vec<&'a MempoolEntry>) -> Vec<&'a MempoolEntry>;
}

/// First come, first included
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrivalOrder;

impl TxSelector for ArrivalOrder {
    fn order<'a>(&self, mut pending: Vec<&'a MempoolEntry>) -> Vec<&'a MempoolEntry> {
        pending.sort_by_key(|e| e.sequence);
        pending
    }
}

/// An unmined block and what it pays
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    pub reward: Amount,
    pub fees: Amount,
    /// Tip generation the template was built against
    pub tip_generation: u64,
}

/// Tip state plus the effects of transactions already picked
struct ScratchView<'a> {
    state: &'a ChainState,
    spent: HashSet<OutPoint>,
    created: HashMap<OutPoint, Utxo>,
    txids: HashSet<Hash>,
}

impl UtxoView for ScratchView<'_> {
    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        if self.spent.contains(outpoint) {
            return None;
        }
        self.created
            .get(outpoint)
            .cloned()
            .or_else(|| self.state.utxo(outpoint))
    }

    fn is_known_tx(&self, txid: &Hash) -> bool {
        self.txids.contains(txid) || self.state.is_known_tx(txid)
    }
}

/// Assemble a child of the current tip paying `miner_address`
pub fn build_template(
    state: &ChainState,
    pending: Vec<&MempoolEntry>,
    selector: &dyn TxSelector,
    miner_address: &str,
    max_transactions: usize,
    now: u64,
) -> BlockTemplate {
    let tip = *state.tip();
    let height = tip.index + 1;
    let rules = state.rules();

    let mut view = ScratchView {
        state,
        spent: HashSet::new(),
        created: HashMap::new(),
        txids: HashSet::new(),
    };
    let mut picked_nonces = NonceTracker::new();
    let mut included = Vec::new();
    let mut fees: Amount = 0;

    for entry in selector.order(pending) {
        if included.len() >= max_transactions {
            break;
        }
        let nonces = LayeredNonces {
            confirmed: state,
            pending: &picked_nonces,
        };
        let validated = match validate_transaction(&entry.tx, &view, &nonces, &rules) {
            Ok(validated) => validated,
            Err(reason) => {
                debug!(event = "template skipped transaction", txid = %entry.txid, %reason);
                continue;
            }
        };
        let Some(total) = fees.checked_add(validated.fee) else {
            continue;
        };
        fees = total;

        for (outpoint, _) in &validated.spent {
            view.created.remove(outpoint);
            view.spent.insert(*outpoint);
        }
        for (index, output) in entry.tx.outputs.iter().enumerate() {
            if output.amount == 0 {
                continue;
            }
            view.created.insert(
                OutPoint::new(validated.txid, index as u32),
                Utxo {
                    address: output.address.clone(),
                    amount: output.amount,
                    script: output.script.clone(),
                    height,
                },
            );
        }
        view.txids.insert(validated.txid);
        picked_nonces.raise_to(&entry.tx.sender, entry.tx.nonce);
        included.push(entry.tx.clone());
    }

    let reward = state.next_reward();
    let timestamp = now.max(tip.timestamp);
    let coinbase = Transaction::coinbase(miner_address, reward.saturating_add(fees), height, timestamp);
    let mut transactions = Vec::with_capacity(included.len() + 1);
    transactions.push(coinbase);
    transactions.extend(included);

    BlockTemplate {
        block: Block::new(height, tip.hash, timestamp, state.next_difficulty(), transactions),
        reward,
        fees,
        tip_generation: 0,
    }
}
