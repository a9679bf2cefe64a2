//! Orphan transactions
//!
//! Correctly signed transactions whose inputs are not visible yet. Held in
//! arrival order, bounded, and aged out like regular entries.

use std::collections::{HashMap, VecDeque};

use crate::crypto::Hash;
use crate::validation::Transaction;

#[derive(Debug, Clone)]
pub struct OrphanTx {
    pub tx: Transaction,
    pub txid: Hash,
    pub added_at: u64,
}

#[derive(Debug)]
pub struct OrphanTxPool {
    entries: HashMap<Hash, OrphanTx>,
    order: VecDeque<Hash>,
    capacity: usize,
}

impl OrphanTxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Insert, evicting the oldest entries past capacity.
    /// Returns false if the transaction was already held.
    pub fn insert(&mut self, tx: Transaction, txid: Hash, now: u64) -> bool {
        if self.capacity == 0 || self.entries.contains_key(&txid) {
            return false;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(txid);
        self.entries.insert(txid, OrphanTx { tx, txid, added_at: now });
        true
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    /// Remove entries older than `max_age` seconds
    pub fn prune_expired(&mut self, now: u64, max_age: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, orphan| now.saturating_sub(orphan.added_at) <= max_age);
        let entries = &self.entries;
        self.order.retain(|txid| entries.contains_key(txid));
        before - self.entries.len()
    }

    /// Take everything out, oldest first
    pub fn drain(&mut self) -> Vec<OrphanTx> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some(txid) = self.order.pop_front() {
            if let Some(orphan) = self.entries.remove(&txid) {
                drained.push(orphan);
            }
        }
        drained
    }

    /// Put back an orphan that still cannot be admitted
    pub fn restore(&mut self, orphan: OrphanTx) {
        let OrphanTx { tx, txid, added_at } = orphan;
        self.insert(tx, txid, added_at);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(n: u64) -> (Transaction, Hash) {
        let tx = Transaction::transfer("a", "b", n, 0, n, vec![], vec![], 0);
        let txid = tx.txid();
        (tx, txid)
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut pool = OrphanTxPool::new(2);
        let (t1, h1) = tx(1);
        let (t2, h2) = tx(2);
        let (t3, h3) = tx(3);
        assert!(pool.insert(t1, h1, 0));
        assert!(pool.insert(t2, h2, 1));
        assert!(pool.insert(t3, h3, 2));

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&h1));
        assert!(pool.contains(&h3));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut pool = OrphanTxPool::new(2);
        let (t1, h1) = tx(1);
        assert!(pool.insert(t1.clone(), h1, 0));
        assert!(!pool.insert(t1, h1, 0));
    }

    #[test]
    fn test_age_eviction_and_drain_order() {
        let mut pool = OrphanTxPool::new(10);
        for n in 1..=3 {
            let (t, h) = tx(n);
            pool.insert(t, h, n * 100);
        }
        assert_eq!(pool.prune_expired(400, 250), 1);

        let drained: Vec<u64> = pool.drain().into_iter().map(|o| o.added_at).collect();
        assert_eq!(drained, vec![200, 300]);
        assert!(pool.is_empty());
    }
}
