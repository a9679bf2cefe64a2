//! Block structure
//!
//! Headers carry no stored hash: [`BlockHeader::hash`] always recomputes it
//! from the current field values, so a mutated header can never be paired
//! with a stale digest.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::crypto::{
    build_merkle_proof, canonical_json_value, compute_merkle_root, hash_bytes, Hash, MerkleProof,
    PrivateKey, PublicKey, SchnorrSignature,
};
use crate::validation::{checked_sum, Amount, Transaction};
use super::{calculate_work, ChainWork};

/// Block header
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    /// Position in the chain, genesis is 0
    pub index: u64,
    /// Hash of the parent header
    pub previous_hash: Hash,
    /// Merkle root of the transaction ids
    pub merkle_root: Hash,
    /// Block timestamp (seconds since Unix epoch)
    pub timestamp: u64,
    /// Required leading zero bits of the header hash
    pub difficulty: u32,
    /// Nonce used for PoW
    pub nonce: u64,
    /// Protocol version, hashed only when set
    #[serde(default)]
    pub version: Option<u32>,
    /// Producer attestation over the header hash
    #[serde(default)]
    pub signature: Option<SchnorrSignature>,
    #[serde(default)]
    pub miner_pubkey: Option<PublicKey>,
}

impl BlockHeader {
    /// Create an unsigned, unversioned header
    pub fn new(
        index: u64,
        previous_hash: Hash,
        merkle_root: Hash,
        timestamp: u64,
        difficulty: u32,
        nonce: u64,
    ) -> Self {
        Self {
            index,
            previous_hash,
            merkle_root,
            timestamp,
            difficulty,
            nonce,
            version: None,
            signature: None,
            miner_pubkey: None,
        }
    }

    /// The hashed subset of the header as a JSON object
    pub fn hash_fields(&self) -> Value {
        let mut fields = json!({
            "index": self.index,
            "previous_hash": self.previous_hash.to_hex(),
            "merkle_root": self.merkle_root.to_hex(),
            "timestamp": self.timestamp,
            "difficulty": self.difficulty,
            "nonce": self.nonce,
        });
        if let (Some(version), Some(map)) = (self.version, fields.as_object_mut()) {
            map.insert("version".into(), json!(version));
        }
        fields
    }

    /// Calculate the hash of this header
    pub fn hash(&self) -> Hash {
        hash_bytes(canonical_json_value(&self.hash_fields()).as_bytes())
    }

    /// Whether the hash carries at least `difficulty` leading zero bits
    pub fn meets_difficulty(&self) -> bool {
        self.hash().leading_zero_bits() >= self.difficulty
    }

    /// Attach a producer signature. Must be redone after any field change.
    pub fn sign(&mut self, key: &PrivateKey) {
        self.miner_pubkey = Some(key.public_key());
        self.signature = Some(key.sign(&self.hash()));
    }

    /// `None` when unsigned, otherwise whether the attestation verifies
    pub fn verify_producer(&self) -> Option<bool> {
        match (&self.miner_pubkey, &self.signature) {
            (Some(key), Some(sig)) => Some(key.verify(&self.hash(), sig)),
            (None, None) => None,
            _ => Some(false),
        }
    }
}

/// Position, timing and cumulative work of a block on some chain
///
/// Enough to validate a child without the parent's body, which is all a
/// checkpoint anchor can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub hash: Hash,
    pub index: u64,
    pub timestamp: u64,
    pub difficulty: u32,
    /// Work of the chain up to and including this block
    pub work: ChainWork,
}

impl BlockMeta {
    /// Meta for `header` with the given cumulative work
    pub fn of(header: &BlockHeader, work: ChainWork) -> Self {
        Self {
            hash: header.hash(),
            index: header.index,
            timestamp: header.timestamp,
            difficulty: header.difficulty,
            work,
        }
    }

    /// Meta for `header` on top of a parent with `parent_work`
    pub fn child(header: &BlockHeader, parent_work: ChainWork) -> Self {
        Self::of(header, parent_work.saturating_add(calculate_work(header.difficulty)))
    }
}

/// Base of a chain that starts at a checkpoint instead of genesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAnchor {
    pub meta: BlockMeta,
    /// Timestamps of the blocks from the start of the anchor's retarget
    /// period up to, not including, the anchor; oldest first
    pub retarget_window: Vec<u64>,
}

/// Anything that wraps a header; lets work and difficulty helpers accept
/// headers and blocks alike
pub trait HasHeader {
    fn header(&self) -> &BlockHeader;
}

impl HasHeader for BlockHeader {
    fn header(&self) -> &BlockHeader {
        self
    }
}

impl HasHeader for Block {
    fn header(&self) -> &BlockHeader {
        &self.header
    }
}

/// A complete block containing header and transactions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// Coinbase first, then transfers in inclusion order
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a block whose merkle root is derived from `transactions`
    pub fn new(
        index: u64,
        previous_hash: Hash,
        timestamp: u64,
        difficulty: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        let merkle_root = merkle_root_of(&transactions);
        Self {
            header: BlockHeader::new(index, previous_hash, merkle_root, timestamp, difficulty, 0),
            transactions,
        }
    }

    /// Get the block hash
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn index(&self) -> u64 {
        self.header.index
    }

    pub fn previous_hash(&self) -> &Hash {
        &self.header.previous_hash
    }

    /// Check if this is the genesis block
    pub fn is_genesis(&self) -> bool {
        self.header.index == 0 && self.header.previous_hash == Hash::zero()
    }

    pub fn txids(&self) -> Vec<Hash> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Merkle root recomputed from the transactions
    pub fn compute_merkle_root(&self) -> Hash {
        merkle_root_of(&self.transactions)
    }

    pub fn has_valid_merkle_root(&self) -> bool {
        self.compute_merkle_root() == self.header.merkle_root
    }

    /// Inclusion proof for `txid`
    pub fn merkle_proof(&self, txid: &Hash) -> Option<MerkleProof> {
        let txids = self.txids();
        let index = txids.iter().position(|id| id == txid)?;
        build_merkle_proof(&txids, index)
    }

    /// The leading coinbase, if present
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Declared fees of all non-coinbase transactions, `None` on overflow
    pub fn total_fees(&self) -> Option<Amount> {
        checked_sum(
            self.transactions
                .iter()
                .filter(|tx| !tx.is_coinbase())
                .map(|tx| tx.fee),
        )
    }

    /// Who produced this block: explicit override, then the header's
    /// producer key, then the coinbase recipient
    pub fn miner(&self, override_address: Option<&str>) -> Option<String> {
        if let Some(address) = override_address {
            return Some(address.to_string());
        }
        if let Some(key) = &self.header.miner_pubkey {
            return Some(key.to_address());
        }
        self.coinbase().map(|tx| tx.recipient.clone())
    }
}

fn merkle_root_of(transactions: &[Transaction]) -> Hash {
    let txids: Vec<Hash> = transactions.iter().map(Transaction::txid).collect();
    compute_merkle_root(&txids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::canonical_json_value;

    fn header() -> BlockHeader {
        BlockHeader::new(1, Hash::zero(), Hash::zero(), 1_700_000_000, 4, 7)
    }

    #[test]
    fn test_hash_is_deterministic() {
        let h = header();
        assert_eq!(h.hash(), h.hash());
        assert_eq!(h.hash(), h.clone().hash());
    }

    #[test]
    fn test_canonical_header_form() {
        let h = header();
        let zero = "0".repeat(64);
        assert_eq!(
            canonical_json_value(&h.hash_fields()),
            format!(
                "{{\"difficulty\":4,\"index\":1,\"merkle_root\":\"{zero}\",\"nonce\":7,\
                 \"previous_hash\":\"{zero}\",\"timestamp\":1700000000}}"
            )
        );
    }

    #[test]
    fn test_version_hashed_only_when_set() {
        let plain = header();
        let mut versioned = header();
        versioned.version = Some(1);
        assert_ne!(plain.hash(), versioned.hash());
        assert!(plain.hash_fields().get("version").is_none());
    }

    #[test]
    fn test_field_mutation_changes_hash() {
        let h = header();
        let mut changed = h.clone();
        changed.nonce += 1;
        assert_ne!(h.hash(), changed.hash());
    }

    #[test]
    fn test_producer_signature_excluded_from_hash() {
        let key = PrivateKey::generate();
        let mut h = header();
        let before = h.hash();
        h.sign(&key);
        assert_eq!(h.hash(), before);
        assert_eq!(h.verify_producer(), Some(true));

        h.timestamp += 1;
        assert_eq!(h.verify_producer(), Some(false));
        assert_eq!(header().verify_producer(), None);
    }

    #[test]
    fn test_merkle_root_derived() {
        let cb = Transaction::coinbase("LXminer", 50, 1, 0);
        let block = Block::new(1, Hash::zero(), 0, 1, vec![cb.clone()]);
        assert!(block.has_valid_merkle_root());
        assert_eq!(block.header.merkle_root, cb.txid());

        let proof = block.merkle_proof(&cb.txid()).unwrap();
        assert!(proof.verify(&cb.txid(), &block.header.merkle_root));
    }

    #[test]
    fn test_miner_resolution_precedence() {
        let key = PrivateKey::generate();
        let cb = Transaction::coinbase("LXcoinbase", 50, 1, 0);
        let mut block = Block::new(1, Hash::zero(), 0, 1, vec![cb]);

        assert_eq!(block.miner(None).as_deref(), Some("LXcoinbase"));
        block.header.sign(&key);
        assert_eq!(block.miner(None), Some(key.public_key().to_address()));
        assert_eq!(block.miner(Some("LXoverride")).as_deref(), Some("LXoverride"));
    }

    #[test]
    fn test_genesis_detection() {
        let block = Block::new(0, Hash::zero(), 0, 1, vec![]);
        assert!(block.is_genesis());
        assert_eq!(block.header.merkle_root, Hash::zero());
    }

    #[test]
    fn test_bincode_roundtrip_keeps_hash() {
        let key = PrivateKey::generate();
        let mut block = Block::new(3, Hash::zero(), 10, 2, vec![Transaction::coinbase("LXm", 5, 3, 10)]);
        block.header.sign(&key);
        let bytes = bincode::serialize(&block).unwrap();
        let decoded: Block = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.hash(), block.hash());
        assert_eq!(decoded, block);
    }
}
