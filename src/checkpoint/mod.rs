//! Checkpoints - verified state snapshots for fast recovery
//!
//! A checkpoint pins a block on the active chain together with the full
//! UTXO set at that block. `state_hash` commits to the data and is always
//! recomputed before a checkpoint is trusted.

pub mod manager;
pub mod sync;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::ConfigError;
use crate::consensus::{calculate_work, BlockHeader, BlockMeta, ChainAnchor, ChainWork};
use crate::crypto::{canonical_hash, Hash, PrivateKey, PublicKey, SchnorrSignature, SignatureError};
use crate::storage::UtxoSnapshot;
use crate::validation::{Amount, NonceSnapshot};

pub use manager::CheckpointManager;
pub use sync::{collect_reports, network_group, CheckpointPeer, NetworkGroup, PeerError, PeerReport, SyncOutcome};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("state hash mismatch at height {height}")]
    StateHashMismatch { height: u64 },
    #[error("declared supply {declared} at height {height}, snapshot holds {actual:?}")]
    SupplyMismatch { height: u64, declared: Amount, actual: Option<Amount> },
    #[error("signature present without a public key")]
    MissingPublicKey,
    #[error("public key present without a signature")]
    MissingSignature,
    #[error("signer {0} is not trusted")]
    UntrustedSigner(String),
    #[error("checkpoint signature does not verify")]
    InvalidSignature,
    #[error("offered work {offered} below recorded {local}")]
    LowerWork { offered: ChainWork, local: ChainWork },
    #[error("no peer reported a checkpoint")]
    NoReports,
    #[error("{agreeing} peers agree, {required} required")]
    InsufficientPeers { agreeing: usize, required: usize },
    #[error("agreeing peers span {groups} network groups, {required} required")]
    InsufficientGroups { groups: usize, required: usize },
    #[error("retarget window holds {found} timestamps, {expected} expected")]
    RetargetWindow { expected: usize, found: usize },
    #[error("checkpoint {height} does not extend far enough past local height {local}")]
    NotAhead { height: u64, local: u64 },
    #[error("key error: {0}")]
    Key(#[from] SignatureError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Committed state at the checkpointed block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub utxo_snapshot: UtxoSnapshot,
    pub timestamp: u64,
    pub difficulty: u32,
    pub total_supply: Amount,
    pub merkle_root: Hash,
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "NonceSnapshot::is_empty")]
    pub sender_nonces: NonceSnapshot,
    /// Timestamps of the earlier blocks in the checkpoint's retarget period
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retarget_window: Vec<u64>,
}

impl CheckpointData {
    /// SHA-256 over the canonical JSON of the data
    pub fn state_hash(&self) -> Result<Hash, serde_json::Error> {
        canonical_hash(self)
    }
}

/// Checkpoint as written to disk and exchanged with peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub height: u64,
    pub block_hash: Hash,
    pub state_hash: Hash,
    pub data: CheckpointData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work: Option<ChainWork>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SchnorrSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<PublicKey>,
}

/// Summary served to peers without the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub height: u64,
    pub block_hash: Hash,
    pub state_hash: Hash,
    pub work: Option<ChainWork>,
    pub signed: bool,
}

impl CheckpointPayload {
    /// Build an unsigned checkpoint of the block `header`
    pub fn build(
        header: &BlockHeader,
        utxo_snapshot: UtxoSnapshot,
        sender_nonces: NonceSnapshot,
        retarget_window: Vec<u64>,
        total_supply: Amount,
        work: ChainWork,
    ) -> Result<Self, CheckpointError> {
        let data = CheckpointData {
            utxo_snapshot,
            timestamp: header.timestamp,
            difficulty: header.difficulty,
            total_supply,
            merkle_root: header.merkle_root,
            nonce: header.nonce,
            sender_nonces,
            retarget_window,
        };
        Ok(Self {
            height: header.index,
            block_hash: header.hash(),
            state_hash: data.state_hash()?,
            data,
            work: Some(work),
            signature: None,
            pubkey: None,
        })
    }

    /// What a signer commits to
    pub fn signing_hash(&self) -> Result<Hash, serde_json::Error> {
        canonical_hash(&json!({
            "height": self.height,
            "block_hash": self.block_hash,
            "state_hash": self.state_hash,
            "work": self.work,
        }))
    }

    pub fn sign(&mut self, key: &PrivateKey) -> Result<(), CheckpointError> {
        let message = self.signing_hash()?;
        self.pubkey = Some(key.public_key());
        self.signature = Some(key.sign(&message));
        Ok(())
    }

    /// Recompute `state_hash` and check the declared supply
    pub fn verify_integrity(&self) -> Result<(), CheckpointError> {
        if self.data.state_hash()? != self.state_hash {
            return Err(CheckpointError::StateHashMismatch { height: self.height });
        }
        let actual = self.data.utxo_snapshot.total();
        if actual != Some(self.data.total_supply) {
            return Err(CheckpointError::SupplyMismatch {
                height: self.height,
                declared: self.data.total_supply,
                actual,
            });
        }
        Ok(())
    }

    /// An attached signature must come from `trusted` and verify.
    /// Unsigned checkpoints pass; a signature or key on its own does not.
    pub fn verify_signature(&self, trusted: &[PublicKey]) -> Result<(), CheckpointError> {
        let (signature, pubkey) = match (&self.signature, &self.pubkey) {
            (None, None) => return Ok(()),
            (Some(_), None) => return Err(CheckpointError::MissingPublicKey),
            (None, Some(_)) => return Err(CheckpointError::MissingSignature),
            (Some(signature), Some(pubkey)) => (signature, pubkey),
        };
        if !trusted.contains(pubkey) {
            return Err(CheckpointError::UntrustedSigner(pubkey.to_hex()));
        }
        if !pubkey.verify(&self.signing_hash()?, signature) {
            return Err(CheckpointError::InvalidSignature);
        }
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Offered work, zero when not declared
    pub fn declared_work(&self) -> ChainWork {
        self.work.unwrap_or(ChainWork::ZERO)
    }

    /// Chain position to anchor a fast-synced chain at
    pub fn anchor_meta(&self) -> BlockMeta {
        BlockMeta {
            hash: self.block_hash,
            index: self.height,
            timestamp: self.data.timestamp,
            difficulty: self.data.difficulty,
            work: self.work.unwrap_or_else(|| calculate_work(self.data.difficulty)),
        }
    }

    /// Anchor for a chain started from this checkpoint. The retarget window
    /// must cover the checkpoint's period under `adjustment_interval`.
    pub fn anchor(&self, adjustment_interval: u64) -> Result<ChainAnchor, CheckpointError> {
        let expected = match adjustment_interval {
            0 => 0,
            interval => (self.height % interval) as usize,
        };
        let found = self.data.retarget_window.len();
        if found != expected {
            return Err(CheckpointError::RetargetWindow { expected, found });
        }
        Ok(ChainAnchor {
            meta: self.anchor_meta(),
            retarget_window: self.data.retarget_window.clone(),
        })
    }

    pub fn metadata(&self) -> CheckpointMetadata {
        CheckpointMetadata {
            height: self.height,
            block_hash: self.block_hash,
            state_hash: self.state_hash,
            work: self.work,
            signed: self.is_signed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;
    use crate::storage::UtxoSet;

    pub(crate) fn payload(height: u64) -> CheckpointPayload {
        let mut utxos = UtxoSet::new();
        utxos.add_utxo("LXholder", hash_bytes(b"coin"), 0, 500, None).unwrap();
        let header = BlockHeader::new(height, hash_bytes(b"parent"), hash_bytes(b"root"), 1_000 + height, 3, 9);
        CheckpointPayload::build(
            &header,
            utxos.snapshot(),
            NonceSnapshot::default(),
            Vec::new(),
            utxos.total_supply(),
            ChainWork(1 << 20),
        )
        .unwrap()
    }

    #[test]
    fn test_integrity_detects_tampering() {
        let good = payload(10);
        assert!(good.verify_integrity().is_ok());

        let mut tampered = good.clone();
        tampered.data.total_supply += 1;
        assert!(matches!(
            tampered.verify_integrity(),
            Err(CheckpointError::StateHashMismatch { height: 10 })
        ));

        let mut forged = good;
        forged.data.total_supply += 1;
        forged.state_hash = forged.data.state_hash().unwrap();
        assert!(matches!(
            forged.verify_integrity(),
            Err(CheckpointError::SupplyMismatch { .. })
        ));
    }

    #[test]
    fn test_json_round_trip_keeps_state_hash() {
        let original = payload(20);
        let text = serde_json::to_string(&original).unwrap();
        let decoded: CheckpointPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, original);
        assert!(decoded.verify_integrity().is_ok());
        assert!(!text.contains("sender_nonces"));
    }

    #[test]
    fn test_signature_policy() {
        let signer = PrivateKey::generate();
        let stranger = PrivateKey::generate();
        let mut signed = payload(30);
        signed.sign(&signer).unwrap();

        assert!(signed.verify_signature(&[signer.public_key()]).is_ok());
        assert!(matches!(
            signed.verify_signature(&[stranger.public_key()]),
            Err(CheckpointError::UntrustedSigner(_))
        ));

        let mut altered = signed.clone();
        altered.height += 1;
        assert!(matches!(
            altered.verify_signature(&[signer.public_key()]),
            Err(CheckpointError::InvalidSignature)
        ));

        assert!(payload(30).verify_signature(&[]).is_ok());

        let mut key_only = payload(30);
        key_only.pubkey = Some(signer.public_key());
        assert!(matches!(
            key_only.verify_signature(&[signer.public_key()]),
            Err(CheckpointError::MissingSignature)
        ));

        let mut signature_only = signed;
        signature_only.pubkey = None;
        assert!(matches!(
            signature_only.verify_signature(&[signer.public_key()]),
            Err(CheckpointError::MissingPublicKey)
        ));
    }

    #[test]
    fn test_anchor_meta() {
        let p = payload(40);
        let anchor = p.anchor_meta();
        assert_eq!(anchor.index, 40);
        assert_eq!(anchor.hash, p.block_hash);
        assert_eq!(anchor.work, ChainWork(1 << 20));

        // height 40 starts a period of 8 or 20, so no earlier timestamps
        assert_eq!(p.anchor(8).unwrap().meta, anchor);
        assert!(p.anchor(20).unwrap().retarget_window.is_empty());
        assert!(matches!(
            p.anchor(50),
            Err(CheckpointError::RetargetWindow { expected: 40, found: 0 })
        ));
    }
}
