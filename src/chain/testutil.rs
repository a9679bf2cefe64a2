//! Shared fixtures for chain tests

use crate::config::{ConsensusParams, Network};
use crate::consensus::{Block, BlockHeader};
use crate::crypto::{Hash, PrivateKey};
use crate::validation::{Amount, OutPoint, Transaction, TxOutput};
use super::ChainState;

pub(crate) const ALLOCATION: Amount = 1_000_000;

/// Grind the nonce until the header meets its own difficulty
pub(crate) fn mine(header: &mut BlockHeader) {
    header.nonce = 0;
    while !header.meets_difficulty() {
        header.nonce += 1;
    }
}

pub(crate) fn key(seed: u8) -> PrivateKey {
    PrivateKey::from_bytes(&[seed; 32]).unwrap()
}

pub(crate) struct Harness {
    pub params: ConsensusParams,
    pub genesis: Block,
    pub funder: PrivateKey,
    pub miner: String,
}

impl Harness {
    /// Regtest rules with a reward of 100 halving every `halving_interval`
    pub fn new(halving_interval: u64) -> Self {
        let params = ConsensusParams {
            initial_reward: 100,
            halving_interval,
            max_supply: u64::MAX / 2,
            initial_difficulty: 1,
            adjustment_interval: 1_000,
            min_fee: 1,
            ..ConsensusParams::for_network(Network::Regtest)
        };
        let funder = key(1);
        let coinbase = Transaction::coinbase(funder.public_key().to_address(), ALLOCATION, 0, 0);
        let mut genesis = Block::new(0, Hash::zero(), 1_000, 1, vec![coinbase]);
        mine(&mut genesis.header);
        Self {
            params,
            genesis,
            funder,
            miner: key(2).public_key().to_address(),
        }
    }

    pub fn state(&self) -> ChainState {
        ChainState::from_genesis(&self.genesis, self.params.clone()).unwrap()
    }

    pub fn genesis_allocation(&self) -> Amount {
        ALLOCATION
    }

    pub fn funder_address(&self) -> String {
        self.funder.public_key().to_address()
    }

    pub fn address(&self, seed: u8) -> String {
        key(seed).public_key().to_address()
    }

    /// Mined child of the current tip paying the full reward plus fees
    pub fn next_block(&self, state: &ChainState, txs: Vec<Transaction>) -> Block {
        self.block_on(state.tip().hash, state.height(), state.tip().timestamp, state.next_difficulty(), state.next_reward(), txs, 0)
    }

    /// Mined child of an arbitrary parent. `salt` varies the coinbase so
    /// competing branches get distinct hashes.
    #[allow(clippy::too_many_arguments)]
    pub fn block_on(
        &self,
        parent: Hash,
        parent_height: u64,
        parent_timestamp: u64,
        difficulty: u32,
        reward: Amount,
        txs: Vec<Transaction>,
        salt: u64,
    ) -> Block {
        let height = parent_height + 1;
        let fees: Amount = txs.iter().map(|tx| tx.fee).sum();
        let timestamp = parent_timestamp + self.params.target_block_time;
        let mut all = vec![Transaction::coinbase(self.miner.clone(), reward + fees, height, timestamp + salt)];
        all.extend(txs);
        let mut block = Block::new(height, parent, timestamp, difficulty, all);
        mine(&mut block.header);
        block
    }

    /// Spend the genesis allocation
    pub fn pay_from_alloc(&self, _state: &ChainState, to: &str, amount: Amount, nonce: u64) -> Transaction {
        let input = OutPoint::new(self.genesis.transactions[0].txid(), 0);
        self.spend(input, ALLOCATION, to, amount, nonce)
    }

    /// Spend output `vout` of `prev`, which the funder must own
    pub fn pay_output(&self, prev: &Transaction, vout: u32, to: &str, amount: Amount, nonce: u64) -> Transaction {
        let value = prev.outputs[vout as usize].amount;
        self.spend(OutPoint::new(prev.txid(), vout), value, to, amount, nonce)
    }

    fn spend(&self, input: OutPoint, value: Amount, to: &str, amount: Amount, nonce: u64) -> Transaction {
        let fee = 1;
        let sender = self.funder_address();
        let mut outputs = vec![TxOutput::new(to, amount)];
        if value > amount + fee {
            outputs.push(TxOutput::new(sender.clone(), value - amount - fee));
        }
        Transaction::transfer(sender, to, amount, fee, nonce, vec![input], outputs, 0).signed(&self.funder)
    }
}
