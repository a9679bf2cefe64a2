//! Pending transaction pool
//!
//! Validated, unconfirmed transactions keyed by txid. The pool never
//! reorders by fee and never evicts to make room: when it is full new
//! transactions are refused. Inclusion order is the miner's business.

pub mod orphan;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::debug;

use crate::config::MempoolConfig;
use crate::crypto::Hash;
use crate::storage::UtxoView;
use crate::validation::{
    validate_transaction, Amount, LayeredNonces, NonceView, OutPoint, RejectionKind, Transaction,
    TxRejection, ValidationRules,
};
use orphan::{OrphanTx, OrphanTxPool};

/// Mempool admission errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction {0} already pending")]
    Duplicate(Hash),
    #[error("mempool full ({0} entries)")]
    Full(usize),
    #[error("output {outpoint} already spent by pending {existing}")]
    DoubleSpend { outpoint: OutPoint, existing: Hash },
    #[error(transparent)]
    Rejected(#[from] TxRejection),
}

impl MempoolError {
    /// Double-spends and replays
    pub fn is_conflict(&self) -> bool {
        match self {
            MempoolError::DoubleSpend { .. } => true,
            MempoolError::Rejected(reason) => reason.kind() == RejectionKind::Conflict,
            _ => false,
        }
    }
}

/// Outcome of a successful admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted(Hash),
    /// Parked until its inputs appear
    Orphaned(Hash),
}

/// A pending transaction
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash,
    pub fee: Amount,
    pub added_at: u64,
    /// Arrival order
    pub sequence: u64,
}

/// Sizes reported in state snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolCounts {
    pub pending: usize,
    pub orphans: usize,
    pub expired_total: u64,
}

/// Pending nonces per sender
#[derive(Debug, Default)]
struct PendingNonces(HashMap<String, BTreeSet<u64>>);

impl PendingNonces {
    fn add(&mut self, sender: &str, nonce: u64) {
        self.0.entry(sender.to_string()).or_default().insert(nonce);
    }

    fn remove(&mut self, sender: &str, nonce: u64) {
        if let Some(set) = self.0.get_mut(sender) {
            set.remove(&nonce);
            if set.is_empty() {
                self.0.remove(sender);
            }
        }
    }
}

impl NonceView for PendingNonces {
    fn last_nonce(&self, sender: &str) -> u64 {
        self.0
            .get(sender)
            .and_then(|set| set.iter().next_back().copied())
            .unwrap_or(0)
    }
}

pub struct Mempool {
    entries: HashMap<Hash, MempoolEntry>,
    spends: HashMap<OutPoint, Hash>,
    pending_nonces: PendingNonces,
    orphans: OrphanTxPool,
    config: MempoolConfig,
    expired_total: u64,
    next_sequence: u64,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            entries: HashMap::new(),
            spends: HashMap::new(),
            pending_nonces: PendingNonces::default(),
            orphans: OrphanTxPool::new(config.orphan_capacity),
            config,
            expired_total: 0,
            next_sequence: 0,
        }
    }

    /// Validate and admit a transaction
    ///
    /// Nonces are checked against the confirmed value raised by anything
    /// already pending for the sender. Transactions with unseen inputs go
    /// to the orphan pool.
    pub fn admit(
        &mut self,
        tx: Transaction,
        utxos: &dyn UtxoView,
        confirmed: &dyn NonceView,
        rules: &ValidationRules,
        now: u64,
    ) -> Result<Admission, MempoolError> {
        self.admit_at(tx, utxos, confirmed, rules, now, now)
    }

    fn admit_at(
        &mut self,
        tx: Transaction,
        utxos: &dyn UtxoView,
        confirmed: &dyn NonceView,
        rules: &ValidationRules,
        added_at: u64,
        now: u64,
    ) -> Result<Admission, MempoolError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) || self.orphans.contains(&txid) {
            return Err(MempoolError::Duplicate(txid));
        }
        for input in &tx.inputs {
            if let Some(existing) = self.spends.get(input) {
                return Err(MempoolError::DoubleSpend {
                    outpoint: *input,
                    existing: *existing,
                });
            }
        }
        if self.entries.len() >= self.config.capacity {
            return Err(MempoolError::Full(self.entries.len()));
        }

        let nonces = LayeredNonces {
            confirmed,
            pending: &self.pending_nonces,
        };
        let validated = match validate_transaction(&tx, utxos, &nonces, rules) {
            Ok(validated) => validated,
            Err(TxRejection::MissingInput(outpoint)) => {
                debug!(event = "orphan transaction", txid = %txid, missing = %outpoint);
                self.orphans.insert(tx, txid, now);
                return Ok(Admission::Orphaned(txid));
            }
            Err(reason) => return Err(reason.into()),
        };

        for input in &tx.inputs {
            self.spends.insert(*input, txid);
        }
        self.pending_nonces.add(&tx.sender, tx.nonce);
        self.entries.insert(
            txid,
            MempoolEntry {
                fee: validated.fee,
                tx,
                txid,
                added_at,
                sequence: self.next_sequence,
            },
        );
        self.next_sequence += 1;
        Ok(Admission::Accepted(txid))
    }

    fn remove_entry(&mut self, txid: &Hash) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.inputs {
            if self.spends.get(input) == Some(txid) {
                self.spends.remove(input);
            }
        }
        self.pending_nonces.remove(&entry.tx.sender, entry.tx.nonce);
        Some(entry)
    }

    /// Re-check everything against new chain state
    ///
    /// Called after blocks connect or a reorg. `returned` are transactions
    /// from disconnected blocks; they go first since their nonces precede
    /// anything pending. Confirmed, conflicting and now-invalid entries are
    /// dropped, orphans whose inputs appeared are promoted. Returns the
    /// number of entries dropped.
    pub fn reconcile(
        &mut self,
        returned: Vec<Transaction>,
        utxos: &dyn UtxoView,
        confirmed: &dyn NonceView,
        rules: &ValidationRules,
        now: u64,
    ) -> usize {
        let mut previous: Vec<MempoolEntry> = self.entries.drain().map(|(_, e)| e).collect();
        previous.sort_by_key(|e| e.sequence);
        self.spends.clear();
        self.pending_nonces = PendingNonces::default();

        let mut dropped = 0;
        for tx in returned.into_iter().filter(|tx| !tx.is_coinbase()) {
            let _ = self.admit_at(tx, utxos, confirmed, rules, now, now);
        }
        for entry in previous {
            if self.admit_at(entry.tx, utxos, confirmed, rules, entry.added_at, now).is_err() {
                dropped += 1;
            }
        }

        for orphan in self.orphans.drain() {
            let OrphanTx { tx, txid, added_at } = orphan;
            match self.admit_at(tx.clone(), utxos, confirmed, rules, added_at, now) {
                Ok(Admission::Accepted(id)) => debug!(event = "orphan promoted", txid = %id),
                Ok(Admission::Orphaned(_)) => {}
                Err(MempoolError::Full(_)) => self.orphans.restore(OrphanTx { tx, txid, added_at }),
                Err(_) => dropped += 1,
            }
        }
        dropped
    }

    /// Drop entries older than `max_age`, along with later-nonce entries
    /// from the same sender that can no longer be mined. Returns how many
    /// were removed.
    pub fn prune_expired(&mut self, now: u64) -> usize {
        let max_age = self.config.max_age.as_secs();
        let expired: Vec<(String, u64)> = self
            .entries
            .values()
            .filter(|e| now.saturating_sub(e.added_at) > max_age)
            .map(|e| (e.tx.sender.clone(), e.tx.nonce))
            .collect();

        let mut removed = 0;
        for (sender, nonce) in expired {
            let stale: Vec<Hash> = self
                .entries
                .values()
                .filter(|e| e.tx.sender == sender && e.tx.nonce >= nonce)
                .map(|e| e.txid)
                .collect();
            for txid in stale {
                if self.remove_entry(&txid).is_some() {
                    removed += 1;
                }
            }
        }
        removed += self.orphans.prune_expired(now, max_age);

        self.expired_total += removed as u64;
        removed
    }

    /// Pending entries, oldest first
    pub fn entries_by_arrival(&self) -> Vec<&MempoolEntry> {
        let mut entries: Vec<&MempoolEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    pub fn get(&self, txid: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn is_orphan(&self, txid: &Hash) -> bool {
        self.orphans.contains(txid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total ever removed by expiry
    pub fn expired_total(&self) -> u64 {
        self.expired_total
    }

    pub fn counts(&self) -> MempoolCounts {
        MempoolCounts {
            pending: self.entries.len(),
            orphans: self.orphans.len(),
            expired_total: self.expired_total,
        }
    }

    /// Forget every pending and orphan transaction
    pub fn clear(&mut self) {
        self.entries.clear();
        self.spends.clear();
        self.pending_nonces = PendingNonces::default();
        self.orphans.clear();
    }
}
