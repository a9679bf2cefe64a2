//! Block miner implementation
//!
//! Grinds header nonces on a template. Every [`CANCEL_CHECK_INTERVAL`]
//! attempts the loop checks the stop signal and whether the tip it is
//! building on is still the tip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::chain::{BlockStatus, Ledger};
use crate::consensus::Block;
use crate::error::LedgerResult;

/// Nonces tried between cancellation checks
pub const CANCEL_CHECK_INTERVAL: u64 = 4_096;

/// Mining result
#[derive(Debug)]
pub enum MiningResult {
    /// Successfully mined a block
    Success(Block),
    /// Stopped, or the tip moved underneath the template
    Interrupted,
    /// Attempt budget spent without a solution
    NoWork,
}

/// Block miner
#[derive(Debug, Clone)]
pub struct Miner {
    /// Address credited by the coinbase
    address: String,
    /// Stop signal
    stop_signal: Arc<AtomicBool>,
    max_attempts: Option<u64>,
}

impl Miner {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            stop_signal: Arc::new(AtomicBool::new(false)),
            max_attempts: None,
        }
    }

    /// Give up after `attempts` nonces per template
    pub fn with_max_attempts(mut self, attempts: u64) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get a stop signal handle
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.stop_signal.store(false, Ordering::SeqCst);
    }

    fn stopped(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    /// Search for a nonce meeting the block's declared difficulty
    ///
    /// `still_current` is polled alongside the stop signal; returning
    /// false abandons the block.
    pub fn mine_block<F>(&self, mut block: Block, still_current: F) -> MiningResult
    where
        F: Fn() -> bool,
    {
        let mut attempts = 0u64;
        loop {
            if attempts % CANCEL_CHECK_INTERVAL == 0 && (self.stopped() || !still_current()) {
                return MiningResult::Interrupted;
            }
            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return MiningResult::NoWork;
            }

            if block.header.meets_difficulty() {
                return MiningResult::Success(block);
            }

            attempts += 1;
            block.header.nonce = match block.header.nonce.checked_add(1) {
                Some(nonce) => nonce,
                None => return MiningResult::NoWork,
            };
        }
    }

    /// Build a template on the ledger's tip, mine it and submit the result
    pub fn mine_once(&self, ledger: &Ledger) -> LedgerResult<MiningResult> {
        let template = ledger.block_template(&self.address, crate::chain::unix_now())?;
        let generation = template.tip_generation;
        let result = self.mine_block(template.block, || ledger.tip_generation() == generation);
        if let MiningResult::Success(block) = &result {
            match ledger.ingest_block(block.clone())? {
                BlockStatus::Connected { height } => {
                    info!(event = "block mined", height, hash = %block.hash(), fees = template.fees)
                }
                other => debug!(event = "mined block not connected", status = ?other),
            }
        }
        Ok(result)
    }

    /// Mine until stopped. Returns how many blocks were mined.
    pub fn run(&self, ledger: &Ledger) -> LedgerResult<u64> {
        let mut mined = 0;
        while !self.stopped() {
            match self.mine_once(ledger)? {
                MiningResult::Success(_) => mined += 1,
                MiningResult::Interrupted | MiningResult::NoWork => {}
            }
        }
        Ok(mined)
    }
}
