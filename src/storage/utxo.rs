//! UTXO set implementation
//!
//! In-memory map of unspent outputs plus a running total of their value.
//! The running total is what [`UtxoSet::verify_utxo_consistency`] audits.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::constants::MAX_SCRIPT_LEN;
use crate::crypto::{canonical_hash, Hash};
use crate::validation::{Amount, OutPoint, Transaction};

/// UTXO set errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UtxoError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("malformed script: {0}")]
    InvalidScript(String),
    #[error("output {0} already exists")]
    Duplicate(OutPoint),
    #[error("output {0} is not in the unspent set")]
    Missing(OutPoint),
    #[error("total supply overflow")]
    SupplyOverflow,
    #[error("malformed snapshot key {0:?}")]
    InvalidSnapshotKey(String),
}

/// Unspent Transaction Output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Owner address
    pub address: String,
    /// Amount in base units
    pub amount: Amount,
    /// Optional hex locking script
    pub script: Option<String>,
    /// Height at which this UTXO was created
    pub height: u64,
}

/// Read access used by the transaction validator
pub trait UtxoView {
    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo>;

    /// Whether `txid` was ever confirmed; lets callers tell a spent input
    /// from one that has not been seen yet
    fn is_known_tx(&self, _txid: &Hash) -> bool {
        false
    }
}

/// Result of an aggregate audit. Never corrected automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Running total maintained on every mutation
    pub expected: u128,
    /// Freshly recomputed sum of live outputs
    pub actual: u128,
    pub utxo_count: usize,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.expected == self.actual
    }
}

/// Snapshot entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub address: String,
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    pub height: u64,
}

/// Sorted `"txid:vout" -> entry` map; the checkpoint and file form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoSnapshot(pub BTreeMap<String, SnapshotEntry>);

impl UtxoSnapshot {
    /// Sum of all entries, `None` on overflow
    pub fn total(&self) -> Option<Amount> {
        crate::validation::checked_sum(self.0.values().map(|e| e.amount))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Set of all unspent transaction outputs
#[derive(Debug, Default, Clone)]
pub struct UtxoSet {
    utxos: HashMap<OutPoint, Utxo>,
    total: Amount,
}

fn validate_address(address: &str) -> Result<(), UtxoError> {
    if address.is_empty() || address.len() > 128 || address.chars().any(char::is_whitespace) {
        return Err(UtxoError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

fn validate_script(script: &Option<String>) -> Result<(), UtxoError> {
    let Some(script) = script else {
        return Ok(());
    };
    if script.is_empty() {
        return Err(UtxoError::InvalidScript("empty".into()));
    }
    if script.len() > MAX_SCRIPT_LEN {
        return Err(UtxoError::InvalidScript(format!("{} chars", script.len())));
    }
    if hex::decode(script).is_err() {
        return Err(UtxoError::InvalidScript("not hex".into()));
    }
    Ok(())
}

fn parse_snapshot_key(key: &str) -> Result<OutPoint, UtxoError> {
    let bad = || UtxoError::InvalidSnapshotKey(key.to_string());
    let (txid, vout) = key.split_once(':').ok_or_else(bad)?;
    Ok(OutPoint {
        txid: Hash::from_hex(txid).map_err(|_| bad())?,
        vout: vout.parse().map_err(|_| bad())?,
    })
}

impl UtxoSet {
    /// Create a new empty UTXO set
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a UTXO exists
    pub fn contains(&self, txid: &Hash, vout: u32) -> bool {
        self.utxos.contains_key(&OutPoint::new(*txid, vout))
    }

    /// Get a UTXO if it exists
    pub fn get(&self, txid: &Hash, vout: u32) -> Option<&Utxo> {
        self.utxos.get(&OutPoint::new(*txid, vout))
    }

    /// Add an output created at height 0
    pub fn add_utxo(
        &mut self,
        address: &str,
        txid: Hash,
        vout: u32,
        amount: Amount,
        script: Option<String>,
    ) -> Result<(), UtxoError> {
        self.insert(
            OutPoint::new(txid, vout),
            Utxo {
                address: address.to_string(),
                amount,
                script,
                height: 0,
            },
        )
    }

    /// Add a fully described output
    pub fn insert(&mut self, outpoint: OutPoint, utxo: Utxo) -> Result<(), UtxoError> {
        validate_address(&utxo.address)?;
        validate_script(&utxo.script)?;
        if self.utxos.contains_key(&outpoint) {
            return Err(UtxoError::Duplicate(outpoint));
        }
        let total = self
            .total
            .checked_add(utxo.amount)
            .ok_or(UtxoError::SupplyOverflow)?;
        self.utxos.insert(outpoint, utxo);
        self.total = total;
        Ok(())
    }

    /// Remove an output; absence is a double-spend signal
    pub fn spend(&mut self, txid: &Hash, vout: u32) -> Result<Utxo, UtxoError> {
        let outpoint = OutPoint::new(*txid, vout);
        let utxo = self
            .utxos
            .remove(&outpoint)
            .ok_or(UtxoError::Missing(outpoint))?;
        self.total -= utxo.amount;
        Ok(utxo)
    }

    /// Apply a transaction: spend its inputs, create its outputs.
    ///
    /// Inputs are checked before anything is removed, so a failure leaves
    /// the set untouched. Zero-value outputs create no entry. Returns the
    /// spent outputs for undo.
    pub fn apply_transaction(
        &mut self,
        tx: &Transaction,
        height: u64,
    ) -> Result<Vec<(OutPoint, Utxo)>, UtxoError> {
        let txid = tx.txid();

        for input in &tx.inputs {
            if !self.utxos.contains_key(input) {
                return Err(UtxoError::Missing(*input));
            }
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(txid, index as u32);
            if output.amount > 0 && self.utxos.contains_key(&outpoint) {
                return Err(UtxoError::Duplicate(outpoint));
            }
            validate_address(&output.address)?;
            validate_script(&output.script)?;
        }

        let mut spent = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let utxo = self.spend(&input.txid, input.vout)?;
            spent.push((*input, utxo));
        }

        for (index, output) in tx.outputs.iter().enumerate() {
            if output.amount == 0 {
                continue;
            }
            let inserted = self.insert(
                OutPoint::new(txid, index as u32),
                Utxo {
                    address: output.address.clone(),
                    amount: output.amount,
                    script: output.script.clone(),
                    height,
                },
            );
            if let Err(e) = inserted {
                // Only supply overflow can get here; put the set back.
                self.revert_transaction(tx, &spent);
                return Err(e);
            }
        }

        Ok(spent)
    }

    /// Revert a transaction: remove its outputs, restore what it spent
    pub fn revert_transaction(&mut self, tx: &Transaction, spent_utxos: &[(OutPoint, Utxo)]) {
        let txid = tx.txid();

        for index in 0..tx.outputs.len() {
            let _ = self.spend(&txid, index as u32);
        }

        for (outpoint, utxo) in spent_utxos {
            if !self.utxos.contains_key(outpoint) {
                self.total = self.total.saturating_add(utxo.amount);
                self.utxos.insert(*outpoint, utxo.clone());
            }
        }
    }

    /// All outputs owned by `address`
    pub fn utxos_for(&self, address: &str) -> Vec<(OutPoint, &Utxo)> {
        let mut owned: Vec<_> = self
            .utxos
            .iter()
            .filter(|(_, utxo)| utxo.address == address)
            .map(|(key, utxo)| (*key, utxo))
            .collect();
        owned.sort_by_key(|(key, _)| *key);
        owned
    }

    /// Total balance of an address
    pub fn get_balance(&self, address: &str) -> Amount {
        self.utxos
            .values()
            .filter(|utxo| utxo.address == address)
            .fold(0u64, |acc, utxo| acc.saturating_add(utxo.amount))
    }

    /// Running total of all live outputs (circulating supply)
    pub fn total_supply(&self) -> Amount {
        self.total
    }

    /// Recompute the aggregate and compare it with the running total
    pub fn verify_utxo_consistency(&self) -> ConsistencyReport {
        let actual = self.utxos.values().map(|u| u.amount as u128).sum();
        ConsistencyReport {
            expected: self.total as u128,
            actual,
            utxo_count: self.utxos.len(),
        }
    }

    /// Sorted copy of the set
    pub fn snapshot(&self) -> UtxoSnapshot {
        UtxoSnapshot(
            self.utxos
                .iter()
                .map(|(outpoint, utxo)| {
                    (
                        outpoint.to_string(),
                        SnapshotEntry {
                            address: utxo.address.clone(),
                            amount: utxo.amount,
                            script: utxo.script.clone(),
                            height: utxo.height,
                        },
                    )
                })
                .collect(),
        )
    }

    /// SHA-256 over the canonical JSON snapshot
    pub fn digest(&self) -> Hash {
        snapshot_digest(&self.snapshot())
    }

    /// Replace the whole set. Nothing changes unless every entry is valid.
    pub fn restore(&mut self, snapshot: &UtxoSnapshot) -> Result<(), UtxoError> {
        let mut fresh = UtxoSet::new();
        for (key, entry) in &snapshot.0 {
            fresh.insert(
                parse_snapshot_key(key)?,
                Utxo {
                    address: entry.address.clone(),
                    amount: entry.amount,
                    script: entry.script.clone(),
                    height: entry.height,
                },
            )?;
        }
        *self = fresh;
        Ok(())
    }

    /// Get total number of UTXOs
    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }
}

/// Digest of a snapshot, identical to [`UtxoSet::digest`] for the same set
pub fn snapshot_digest(snapshot: &UtxoSnapshot) -> Hash {
    // A BTreeMap of plain structs always converts to JSON.
    canonical_hash(snapshot).unwrap_or_default()
}

impl UtxoView for UtxoSet {
    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.utxos.get(outpoint).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;
    use crate::validation::TxOutput;

    fn make_hash(s: &str) -> Hash {
        hash_bytes(s.as_bytes())
    }

    #[test]
    fn test_utxo_add_and_get() {
        let mut set = UtxoSet::new();
        let txid = make_hash("tx1");

        set.add_utxo("owner", txid, 0, 100, None).unwrap();

        assert!(set.contains(&txid, 0));
        assert!(!set.contains(&txid, 1));
        assert_eq!(set.get(&txid, 0).unwrap().amount, 100);
        assert_eq!(set.total_supply(), 100);
    }

    #[test]
    fn test_add_rejects_malformed_script_and_duplicates() {
        let mut set = UtxoSet::new();
        let txid = make_hash("tx1");

        assert!(matches!(
            set.add_utxo("owner", txid, 0, 1, Some("zz".into())),
            Err(UtxoError::InvalidScript(_))
        ));
        assert!(matches!(
            set.add_utxo("owner", txid, 0, 1, Some(String::new())),
            Err(UtxoError::InvalidScript(_))
        ));
        assert!(matches!(
            set.add_utxo("", txid, 0, 1, None),
            Err(UtxoError::InvalidAddress(_))
        ));

        set.add_utxo("owner", txid, 0, 1, Some("76a9".into())).unwrap();
        assert_eq!(
            set.add_utxo("owner", txid, 0, 1, None),
            Err(UtxoError::Duplicate(OutPoint::new(txid, 0)))
        );
        assert_eq!(set.total_supply(), 1);
    }

    #[test]
    fn test_add_rejects_supply_overflow() {
        let mut set = UtxoSet::new();
        set.add_utxo("a", make_hash("1"), 0, u64::MAX, None).unwrap();
        assert_eq!(
            set.add_utxo("a", make_hash("2"), 0, 1, None),
            Err(UtxoError::SupplyOverflow)
        );
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_spend_twice_fails() {
        let mut set = UtxoSet::new();
        let txid = make_hash("tx1");
        set.add_utxo("owner", txid, 0, 100, None).unwrap();

        assert_eq!(set.spend(&txid, 0).unwrap().amount, 100);
        assert_eq!(
            set.spend(&txid, 0),
            Err(UtxoError::Missing(OutPoint::new(txid, 0)))
        );
        assert_eq!(set.total_supply(), 0);
    }

    #[test]
    fn test_get_balance() {
        let mut set = UtxoSet::new();
        set.add_utxo("owner", make_hash("tx1"), 0, 100, None).unwrap();
        set.add_utxo("owner", make_hash("tx2"), 0, 200, None).unwrap();
        set.add_utxo("other", make_hash("tx3"), 0, 50, None).unwrap();

        assert_eq!(set.get_balance("owner"), 300);
        assert_eq!(set.utxos_for("owner").len(), 2);
        assert!(set.verify_utxo_consistency().is_consistent());
    }

    #[test]
    fn test_apply_and_revert_transaction() {
        let mut set = UtxoSet::new();
        let coinbase = Transaction::coinbase("miner", 5000, 1, 0);
        set.apply_transaction(&coinbase, 1).unwrap();
        assert_eq!(set.get_balance("miner"), 5000);

        let spend = Transaction::transfer(
            "miner",
            "bob",
            3000,
            100,
            1,
            vec![OutPoint::new(coinbase.txid(), 0)],
            vec![TxOutput::new("bob", 3000), TxOutput::new("miner", 1900)],
            0,
        );
        let spent = set.apply_transaction(&spend, 2).unwrap();
        assert_eq!(set.get_balance("bob"), 3000);
        assert_eq!(set.total_supply(), 4900);

        set.revert_transaction(&spend, &spent);
        assert_eq!(set.get_balance("bob"), 0);
        assert_eq!(set.get_balance("miner"), 5000);
        assert!(set.verify_utxo_consistency().is_consistent());
    }

    #[test]
    fn test_apply_missing_input_leaves_set_untouched() {
        let mut set = UtxoSet::new();
        set.add_utxo("a", make_hash("x"), 0, 10, None).unwrap();
        let before = set.digest();

        let tx = Transaction::transfer(
            "a",
            "b",
            10,
            0,
            1,
            vec![OutPoint::new(make_hash("x"), 0), OutPoint::new(make_hash("y"), 0)],
            vec![TxOutput::new("b", 10)],
            0,
        );
        assert!(matches!(set.apply_transaction(&tx, 1), Err(UtxoError::Missing(_))));
        assert_eq!(set.digest(), before);
    }

    #[test]
    fn test_restore_is_all_or_nothing() {
        let mut set = UtxoSet::new();
        set.add_utxo("a", make_hash("x"), 0, 10, None).unwrap();
        let before = set.snapshot();

        let mut bad = UtxoSnapshot::default();
        bad.0.insert(
            format!("{}:0", make_hash("ok")),
            SnapshotEntry { address: "b".into(), amount: 5, script: None, height: 1 },
        );
        bad.0.insert(
            "not-a-key".into(),
            SnapshotEntry { address: "c".into(), amount: 5, script: None, height: 1 },
        );

        assert!(set.restore(&bad).is_err());
        assert_eq!(set.snapshot(), before);

        let mut good = UtxoSnapshot::default();
        good.0.insert(
            format!("{}:3", make_hash("ok")),
            SnapshotEntry { address: "b".into(), amount: 5, script: None, height: 1 },
        );
        set.restore(&good).unwrap();
        assert_eq!(set.total_supply(), 5);
        assert!(set.contains(&make_hash("ok"), 3));
    }

    #[test]
    fn test_digest_independent_of_insertion_order() {
        let mut a = UtxoSet::new();
        let mut b = UtxoSet::new();
        a.add_utxo("x", make_hash("1"), 0, 1, None).unwrap();
        a.add_utxo("y", make_hash("2"), 0, 2, None).unwrap();
        b.add_utxo("y", make_hash("2"), 0, 2, None).unwrap();
        b.add_utxo("x", make_hash("1"), 0, 1, None).unwrap();
        assert_eq!(a.digest(), b.digest());
    }
}
