//! Block and chain validation
//!
//! Pure checks on headers, proof of work and the coinbase. Transaction
//! checks happen while a block is connected, against live state.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use crate::config::ConsensusParams;
use crate::consensus::{Block, BlockHeader, BlockMeta, HasHeader};
use crate::crypto::Hash;
use crate::validation::{Amount, OutPoint, TxRejection};

/// Consensus violations. The block is rejected and nothing is mutated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsensusViolation {
    #[error("previous hash {found} does not match parent {expected}")]
    InvalidPrevHash { expected: Hash, found: Hash },
    #[error("index {found}, expected {expected}")]
    InvalidIndex { expected: u64, found: u64 },
    #[error("difficulty {found}, expected {expected}")]
    InvalidDifficulty { expected: u32, found: u32 },
    #[error("hash has {found} leading zero bits, {required} required")]
    InvalidPoW { required: u32, found: u32 },
    #[error("merkle root does not match transactions")]
    InvalidMerkleRoot,
    #[error("timestamp {found} earlier than parent {parent}")]
    TimestampBeforeParent { parent: u64, found: u64 },
    #[error("timestamp {found} too far ahead (limit {limit})")]
    TimestampInFuture { limit: u64, found: u64 },
    #[error("producer signature does not verify")]
    InvalidProducerSignature,
    #[error("block has no coinbase")]
    MissingCoinbase,
    #[error("coinbase at position {0}, must be first and unique")]
    MisplacedCoinbase(usize),
    #[error("coinbase spends inputs")]
    CoinbaseHasInputs,
    #[error("coinbase nonce {found} must equal block height {expected}")]
    CoinbaseHeight { expected: u64, found: u64 },
    #[error("coinbase claims {claimed}, reward plus fees allow {allowed}")]
    CoinbaseOverpays { claimed: Amount, allowed: Amount },
    #[error("amount overflow in block")]
    AmountOverflow,
    #[error("transaction {txid} listed twice")]
    DuplicateTransaction { txid: Hash },
    #[error("output {0} spent twice in block")]
    DoubleSpend(OutPoint),
    #[error("transaction {index} invalid: {reason}")]
    InvalidTransaction { index: usize, reason: TxRejection },
    #[error("transaction {index} could not be applied: {reason}")]
    UnappliableTransaction { index: usize, reason: String },
    #[error("block does not extend a known chain")]
    UnknownParent,
}

/// Validate proof of work
pub fn validate_pow(header: &BlockHeader) -> Result<(), ConsensusViolation> {
    let found = header.hash().leading_zero_bits();
    if found < header.difficulty {
        return Err(ConsensusViolation::InvalidPoW {
            required: header.difficulty,
            found,
        });
    }
    Ok(())
}

/// Validate merkle root matches transactions
pub fn validate_merkle_root(block: &Block) -> Result<(), ConsensusViolation> {
    if !block.has_valid_merkle_root() {
        return Err(ConsensusViolation::InvalidMerkleRoot);
    }
    Ok(())
}

/// Check a header against its parent
///
/// Covers linkage, position, difficulty, timestamp bounds, proof of work
/// and the producer attestation when one is attached.
pub fn validate_header(
    header: &BlockHeader,
    parent: &BlockMeta,
    expected_difficulty: u32,
    now: u64,
    params: &ConsensusParams,
) -> Result<(), ConsensusViolation> {
    if header.previous_hash != parent.hash {
        return Err(ConsensusViolation::InvalidPrevHash {
            expected: parent.hash,
            found: header.previous_hash,
        });
    }
    if header.index != parent.index + 1 {
        return Err(ConsensusViolation::InvalidIndex {
            expected: parent.index + 1,
            found: header.index,
        });
    }
    if header.difficulty != expected_difficulty {
        return Err(ConsensusViolation::InvalidDifficulty {
            expected: expected_difficulty,
            found: header.difficulty,
        });
    }
    if header.timestamp < parent.timestamp {
        return Err(ConsensusViolation::TimestampBeforeParent {
            parent: parent.timestamp,
            found: header.timestamp,
        });
    }
    let limit = now.saturating_add(params.max_future_drift);
    if header.timestamp > limit {
        return Err(ConsensusViolation::TimestampInFuture {
            limit,
            found: header.timestamp,
        });
    }
    validate_pow(header)?;
    if header.verify_producer() == Some(false) {
        return Err(ConsensusViolation::InvalidProducerSignature);
    }
    Ok(())
}

/// Validate block reward
///
/// Exactly one coinbase, first, without inputs, tagged with the block
/// height, paying no more than `reward + fees`. Returns the block's fees.
pub fn validate_coinbase(block: &Block, reward: Amount) -> Result<Amount, ConsensusViolation> {
    let coinbase = block.coinbase().ok_or(ConsensusViolation::MissingCoinbase)?;
    if let Some(position) = block
        .transactions
        .iter()
        .skip(1)
        .position(|tx| tx.is_coinbase())
    {
        return Err(ConsensusViolation::MisplacedCoinbase(position + 1));
    }
    if !coinbase.inputs.is_empty() {
        return Err(ConsensusViolation::CoinbaseHasInputs);
    }
    if coinbase.nonce != block.index() {
        return Err(ConsensusViolation::CoinbaseHeight {
            expected: block.index(),
            found: coinbase.nonce,
        });
    }

    let fees = block.total_fees().ok_or(ConsensusViolation::AmountOverflow)?;
    let allowed = reward.checked_add(fees).ok_or(ConsensusViolation::AmountOverflow)?;
    let claimed = coinbase
        .total_output_value()
        .ok_or(ConsensusViolation::AmountOverflow)?;
    if claimed > allowed {
        return Err(ConsensusViolation::CoinbaseOverpays { claimed, allowed });
    }
    Ok(fees)
}

/// No transaction appears twice
pub fn validate_unique_transactions(block: &Block) -> Result<(), ConsensusViolation> {
    let mut seen = std::collections::HashSet::with_capacity(block.transactions.len());
    for txid in block.txids() {
        if !seen.insert(txid) {
            return Err(ConsensusViolation::DuplicateTransaction { txid });
        }
    }
    Ok(())
}

/// Cumulative proof of work, `Σ 2^difficulty`
///
/// Saturates instead of wrapping. Serialized as a decimal string because
/// JSON numbers lose precision past 2^53.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainWork(pub u128);

impl ChainWork {
    pub const ZERO: ChainWork = ChainWork(0);

    pub fn saturating_add(self, other: ChainWork) -> ChainWork {
        ChainWork(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: ChainWork) -> ChainWork {
        ChainWork(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for ChainWork {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainWork {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<u128>().map(ChainWork).map_err(de::Error::custom)
    }
}

/// Work contributed by a single header
pub fn calculate_work(difficulty: u32) -> ChainWork {
    if difficulty >= 128 {
        return ChainWork(u128::MAX);
    }
    ChainWork(1u128 << difficulty)
}

/// Total work of a sequence of headers or blocks
pub fn chain_work<'a, H, I>(items: I) -> ChainWork
where
    H: HasHeader + 'a,
    I: IntoIterator<Item = &'a H>,
{
    items
        .into_iter()
        .fold(ChainWork::ZERO, |acc, item| {
            acc.saturating_add(calculate_work(item.header().difficulty))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use crate::validation::{Transaction, TxOutput};

    fn params() -> ConsensusParams {
        ConsensusParams::for_network(Network::Regtest)
    }

    fn mine(header: &mut BlockHeader) {
        while !header.meets_difficulty() {
            header.nonce += 1;
        }
    }

    fn child_of(parent: &BlockHeader, transactions: Vec<Transaction>) -> Block {
        let mut block = Block::new(
            parent.index + 1,
            parent.hash(),
            parent.timestamp + 10,
            parent.difficulty,
            transactions,
        );
        mine(&mut block.header);
        block
    }

    fn meta(header: &BlockHeader) -> BlockMeta {
        BlockMeta::of(header, calculate_work(header.difficulty))
    }

    fn genesis() -> BlockHeader {
        BlockHeader::new(0, Hash::zero(), Hash::zero(), 1_000, 2, 0)
    }

    #[test]
    fn test_valid_header_accepted() {
        let parent = genesis();
        let block = child_of(&parent, vec![Transaction::coinbase("LXm", 10, 1, 0)]);
        assert!(validate_header(&block.header, &meta(&parent), 2, 2_000, &params()).is_ok());
    }

    #[test]
    fn test_header_linkage_and_index() {
        let parent = genesis();
        let mut block = child_of(&parent, vec![]);
        block.header.previous_hash = Hash::zero();
        assert!(matches!(
            validate_header(&block.header, &meta(&parent), 2, 2_000, &params()),
            Err(ConsensusViolation::InvalidPrevHash { .. })
        ));

        let mut block = child_of(&parent, vec![]);
        block.header.index = 5;
        assert_eq!(
            validate_header(&block.header, &meta(&parent), 2, 2_000, &params()),
            Err(ConsensusViolation::InvalidIndex { expected: 1, found: 5 })
        );
    }

    #[test]
    fn test_header_difficulty_and_pow() {
        let parent = genesis();
        let block = child_of(&parent, vec![]);
        assert_eq!(
            validate_header(&block.header, &meta(&parent), 3, 2_000, &params()),
            Err(ConsensusViolation::InvalidDifficulty { expected: 3, found: 2 })
        );

        // Unmined header at a difficulty it almost surely misses.
        let mut hard = BlockHeader::new(1, parent.hash(), Hash::zero(), 1_010, 64, 0);
        hard.nonce = 1;
        assert!(matches!(validate_pow(&hard), Err(ConsensusViolation::InvalidPoW { required: 64, .. })));
    }

    #[test]
    fn test_header_timestamps() {
        let parent = genesis();
        let mut early = BlockHeader::new(1, parent.hash(), Hash::zero(), 999, 2, 0);
        mine(&mut early);
        assert_eq!(
            validate_header(&early, &meta(&parent), 2, 2_000, &params()),
            Err(ConsensusViolation::TimestampBeforeParent { parent: 1_000, found: 999 })
        );

        let p = params();
        let mut late = BlockHeader::new(1, parent.hash(), Hash::zero(), 2_000 + p.max_future_drift + 1, 2, 0);
        mine(&mut late);
        assert!(matches!(
            validate_header(&late, &meta(&parent), 2, 2_000, &p),
            Err(ConsensusViolation::TimestampInFuture { .. })
        ));
    }

    #[test]
    fn test_forged_producer_signature_rejected() {
        let parent = genesis();
        let key = crate::crypto::PrivateKey::generate();
        let mut block = child_of(&parent, vec![]);
        block.header.sign(&key);
        assert!(validate_header(&block.header, &meta(&parent), 2, 2_000, &params()).is_ok());

        block.header.miner_pubkey = Some(crate::crypto::PrivateKey::generate().public_key());
        assert_eq!(
            validate_header(&block.header, &meta(&parent), 2, 2_000, &params()),
            Err(ConsensusViolation::InvalidProducerSignature)
        );
    }

    #[test]
    fn test_merkle_validation() {
        let parent = genesis();
        let mut block = child_of(&parent, vec![Transaction::coinbase("LXm", 10, 1, 0)]);
        assert!(validate_merkle_root(&block).is_ok());

        block.transactions.push(Transaction::coinbase("LXm", 10, 2, 0));
        assert_eq!(validate_merkle_root(&block), Err(ConsensusViolation::InvalidMerkleRoot));
    }

    fn transfer(fee: Amount) -> Transaction {
        Transaction::transfer("a", "b", 10, fee, 1, vec![], vec![TxOutput::new("b", 10)], 0)
    }

    #[test]
    fn test_coinbase_may_claim_reward_plus_fees() {
        let parent = genesis();
        let block = child_of(
            &parent,
            vec![Transaction::coinbase("LXm", 55, 1, 0), transfer(3), transfer(2)],
        );
        assert_eq!(validate_coinbase(&block, 50), Ok(5));

        let greedy = child_of(&parent, vec![Transaction::coinbase("LXm", 56, 1, 0), transfer(5)]);
        assert_eq!(
            validate_coinbase(&greedy, 50),
            Err(ConsensusViolation::CoinbaseOverpays { claimed: 56, allowed: 55 })
        );
    }

    #[test]
    fn test_coinbase_placement() {
        let parent = genesis();
        let none = child_of(&parent, vec![transfer(1)]);
        assert_eq!(validate_coinbase(&none, 50), Err(ConsensusViolation::MissingCoinbase));

        let two = child_of(
            &parent,
            vec![Transaction::coinbase("LXm", 1, 1, 0), Transaction::coinbase("LXm", 1, 1, 1)],
        );
        assert_eq!(validate_coinbase(&two, 50), Err(ConsensusViolation::MisplacedCoinbase(1)));

        let wrong_height = child_of(&parent, vec![Transaction::coinbase("LXm", 1, 7, 0)]);
        assert_eq!(
            validate_coinbase(&wrong_height, 50),
            Err(ConsensusViolation::CoinbaseHeight { expected: 1, found: 7 })
        );
    }

    #[test]
    fn test_chain_work_accepts_headers_and_blocks() {
        let parent = genesis();
        let block = child_of(&parent, vec![]);
        let headers = vec![parent.clone(), block.header.clone()];
        let blocks = vec![Block::new(0, Hash::zero(), 1_000, 2, vec![]), block];

        assert_eq!(chain_work(&headers), ChainWork(8));
        assert_eq!(chain_work(&blocks), ChainWork(8));
        assert_eq!(calculate_work(200), ChainWork(u128::MAX));
    }

    #[test]
    fn test_chain_work_serializes_as_string() {
        let work = ChainWork(u128::MAX);
        let json = serde_json::to_string(&work).unwrap();
        assert_eq!(json, format!("\"{}\"", u128::MAX));
        assert_eq!(serde_json::from_str::<ChainWork>(&json).unwrap(), work);
    }
}
