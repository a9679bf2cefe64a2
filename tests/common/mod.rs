//! Fixtures shared by the integration tests

#![allow(dead_code)]

use std::path::Path;

use ledger_core::chain::{BlockStatus, Ledger, LedgerOptions};
use ledger_core::config::{ConsensusParams, Network, NodeConfig};
use ledger_core::consensus::{scheduled_reward, Block, BlockHeader};
use ledger_core::crypto::{Hash, PrivateKey};
use ledger_core::validation::{Amount, OutPoint, Transaction, TxOutput};

/// Clock used for every ingest; far past any block timestamp
pub const NOW: u64 = 10_000_000;

/// Coins the funder owns in genesis
pub const ALLOCATION: Amount = 1_000_000;

pub fn mine(header: &mut BlockHeader) {
    header.nonce = 0;
    while !header.meets_difficulty() {
        header.nonce += 1;
    }
}

pub fn key(seed: u8) -> PrivateKey {
    PrivateKey::from_bytes(&[seed; 32]).unwrap()
}

pub fn address(seed: u8) -> String {
    key(seed).public_key().to_address()
}

/// A regtest network with a genesis paying a known key
pub struct TestNet {
    pub config: NodeConfig,
    pub genesis: Block,
    pub funder: PrivateKey,
    pub miner: String,
}

impl TestNet {
    pub fn new() -> Self {
        Self::with_params(|_| {})
    }

    /// Difficulty 1 and no retargets, adjusted by `tweak`
    pub fn with_params(tweak: impl FnOnce(&mut NodeConfig)) -> Self {
        let mut config = NodeConfig::default();
        config.consensus = ConsensusParams {
            initial_reward: 100,
            halving_interval: 1_000,
            initial_difficulty: 1,
            adjustment_interval: 100_000,
            min_fee: 1,
            ..ConsensusParams::for_network(Network::Regtest)
        };
        tweak(&mut config);

        let funder = key(1);
        let coinbase = Transaction::coinbase(funder.public_key().to_address(), ALLOCATION, 0, 1_000);
        let mut genesis = Block::new(0, Hash::zero(), 1_000, 1, vec![coinbase]);
        mine(&mut genesis.header);
        Self {
            config,
            genesis,
            funder,
            miner: address(2),
        }
    }

    fn options(&self) -> LedgerOptions {
        LedgerOptions {
            genesis: Some(self.genesis.clone()),
            ..LedgerOptions::default()
        }
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::temporary_with(self.config.clone(), self.options()).unwrap()
    }

    /// Ledger persisted under `dir`
    pub fn open(&self, dir: &Path) -> Ledger {
        let mut config = self.config.clone();
        config.data_dir = dir.to_path_buf();
        Ledger::open_with(config, self.options()).unwrap()
    }

    pub fn funder_address(&self) -> String {
        self.funder.public_key().to_address()
    }

    /// Mine the ledger's template and connect it
    pub fn mine_next(&self, ledger: &Ledger) -> Block {
        let mut block = ledger.block_template(&self.miner, NOW).unwrap().block;
        mine(&mut block.header);
        let status = ledger.ingest_block_at(block.clone(), NOW).unwrap();
        assert!(matches!(status, BlockStatus::Connected { .. }), "{status:?}");
        block
    }

    pub fn mine_blocks(&self, ledger: &Ledger, n: usize) -> Vec<Block> {
        (0..n).map(|_| self.mine_next(ledger)).collect()
    }

    /// Mined empty child of `parent`. `salt` separates competing branches.
    pub fn child_of(&self, parent: &Block, salt: u64) -> Block {
        let height = parent.index() + 1;
        let timestamp = parent.header.timestamp + 1 + salt;
        let reward = scheduled_reward(height, &self.config.consensus);
        let coinbase = Transaction::coinbase(self.miner.clone(), reward, height, timestamp);
        let mut block = Block::new(height, parent.hash(), timestamp, parent.header.difficulty, vec![coinbase]);
        mine(&mut block.header);
        block
    }

    /// `n` chained children starting at `parent`
    pub fn branch_from(&self, parent: &Block, n: usize, salt: u64) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::with_capacity(n);
        for _ in 0..n {
            let next = self.child_of(blocks.last().unwrap_or(parent), salt);
            blocks.push(next);
        }
        blocks
    }

    /// Funder pays `amount` to `to` out of the genesis allocation
    pub fn pay_from_genesis(&self, to: &str, amount: Amount, nonce: u64) -> Transaction {
        let input = OutPoint::new(self.genesis.transactions[0].txid(), 0);
        let sender = self.funder_address();
        let fee = 1;
        let outputs = vec![
            TxOutput::new(to, amount),
            TxOutput::new(sender.clone(), ALLOCATION - amount - fee),
        ];
        Transaction::transfer(sender, to, amount, fee, nonce, vec![input], outputs, 0).signed(&self.funder)
    }

    /// Funder spends output `vout` of `prev`
    pub fn pay_from(&self, prev: &Transaction, vout: u32, to: &str, amount: Amount, nonce: u64) -> Transaction {
        let value = prev.outputs[vout as usize].amount;
        let sender = self.funder_address();
        let fee = 1;
        let mut outputs = vec![TxOutput::new(to, amount)];
        if value > amount + fee {
            outputs.push(TxOutput::new(sender.clone(), value - amount - fee));
        }
        Transaction::transfer(sender, to, amount, fee, nonce, vec![OutPoint::new(prev.txid(), vout)], outputs, 0)
            .signed(&self.funder)
    }
}
