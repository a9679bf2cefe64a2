//! Per-sender nonce tracking
//!
//! A hard sequential gate: the only acceptable nonce for a sender is
//! `last + 1`. Unknown senders have `last = 0`, so their first nonce is 1.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Nonce rejections. Neither mutates the tracker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NonceError {
    #[error("nonce {nonce} for {sender} already used (last accepted {last})")]
    Replay { sender: String, nonce: u64, last: u64 },
    #[error("nonce {nonce} for {sender} skips ahead (expected {expected})")]
    Gap { sender: String, nonce: u64, expected: u64 },
}

/// Read access to the last accepted nonce per sender
pub trait NonceView {
    fn last_nonce(&self, sender: &str) -> u64;

    fn expected_nonce(&self, sender: &str) -> u64 {
        self.last_nonce(sender).saturating_add(1)
    }

    /// Check `incoming` against the expected nonce without mutating
    fn check_nonce(&self, sender: &str, incoming: u64) -> Result<(), NonceError> {
        let last = self.last_nonce(sender);
        if incoming <= last {
            return Err(NonceError::Replay {
                sender: sender.to_string(),
                nonce: incoming,
                last,
            });
        }
        let expected = last.saturating_add(1);
        if incoming != expected {
            return Err(NonceError::Gap {
                sender: sender.to_string(),
                nonce: incoming,
                expected,
            });
        }
        Ok(())
    }
}

/// Last accepted nonce per sender
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonceTracker {
    last: HashMap<String, u64>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept and advance only if `incoming == last + 1`
    pub fn check_and_increment(&mut self, sender: &str, incoming: u64) -> Result<(), NonceError> {
        self.check_nonce(sender, incoming)?;
        self.last.insert(sender.to_string(), incoming);
        Ok(())
    }

    /// Put a sender back to `previous` (block disconnect)
    pub fn rewind(&mut self, sender: &str, previous: u64) {
        if previous == 0 {
            self.last.remove(sender);
        } else {
            self.last.insert(sender.to_string(), previous);
        }
    }

    /// Raise a sender's floor without the sequential check
    pub fn raise_to(&mut self, sender: &str, nonce: u64) {
        let entry = self.last.entry(sender.to_string()).or_insert(0);
        if nonce > *entry {
            *entry = nonce;
        }
    }

    /// Number of senders seen
    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }

    pub fn clear(&mut self) {
        self.last.clear();
    }

    /// Sorted copy for checkpoints
    pub fn snapshot(&self) -> NonceSnapshot {
        NonceSnapshot(self.last.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }

    /// Replace all state from a snapshot
    pub fn restore(&mut self, snapshot: &NonceSnapshot) {
        self.last = snapshot.0.iter().map(|(k, v)| (k.clone(), *v)).collect();
    }
}

impl NonceView for NonceTracker {
    fn last_nonce(&self, sender: &str) -> u64 {
        self.last.get(sender).copied().unwrap_or(0)
    }
}

/// Sorted sender → last nonce map, the checkpoint form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceSnapshot(pub BTreeMap<String, u64>);

impl NonceSnapshot {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pending nonces layered over confirmed ones (mempool admission)
pub struct LayeredNonces<'a> {
    pub confirmed: &'a dyn NonceView,
    pub pending: &'a dyn NonceView,
}

impl NonceView for LayeredNonces<'_> {
    fn last_nonce(&self, sender: &str) -> u64 {
        self.confirmed
            .last_nonce(sender)
            .max(self.pending.last_nonce(sender))
    }
}
