//! Transaction structure
//!
//! Account-addressed transfers that spend explicit UTXO inputs. The txid
//! commits to every field except the signature, so a transaction can be
//! hashed, handed to an offline signer, and signed afterwards.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::constants::COINBASE_SENDER;
use crate::crypto::{canonical_json_value, hash_bytes, Hash, PrivateKey, PublicKey, SchnorrSignature, SignatureError};
use super::amount::{checked_sum, parse_amount, Amount, AmountError};

/// Transaction kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    #[default]
    Normal,
    Coinbase,
    Governance,
    ContractCall,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Normal => "normal",
            TxType::Coinbase => "coinbase",
            TxType::Governance => "governance",
            TxType::ContractCall => "contract_call",
        }
    }
}

/// Reference to a transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Recipient address
    pub address: String,
    /// Amount in base units
    pub amount: Amount,
    /// Optional hex locking script, carried but not executed
    #[serde(default)]
    pub script: Option<String>,
}

impl TxOutput {
    pub fn new(address: impl Into<String>, amount: Amount) -> Self {
        Self {
            address: address.into(),
            amount,
            script: None,
        }
    }
}

/// A complete transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub recipient: String,
    pub amount: Amount,
    pub fee: Amount,
    /// Per-sender sequence number, first is 1
    pub nonce: u64,
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOutput>,
    #[serde(default)]
    pub signature: Option<SchnorrSignature>,
    #[serde(default)]
    pub public_key: Option<PublicKey>,
    pub timestamp: u64,
    #[serde(default)]
    pub tx_type: TxType,
}

impl Transaction {
    /// Create an unsigned transfer
    #[allow(clippy::too_many_arguments)]
    pub fn transfer(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: Amount,
        fee: Amount,
        nonce: u64,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOutput>,
        timestamp: u64,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            amount,
            fee,
            nonce,
            inputs,
            outputs,
            signature: None,
            public_key: None,
            timestamp,
            tx_type: TxType::Normal,
        }
    }

    /// Create a coinbase transaction paying `amount` at `height`
    ///
    /// The height is the coinbase nonce, so coinbases paying the same
    /// recipient the same amount still have distinct txids.
    pub fn coinbase(recipient: impl Into<String>, amount: Amount, height: u64, timestamp: u64) -> Self {
        let recipient = recipient.into();
        Self {
            sender: COINBASE_SENDER.to_string(),
            outputs: vec![TxOutput::new(recipient.clone(), amount)],
            recipient,
            amount,
            fee: 0,
            nonce: height,
            inputs: Vec::new(),
            signature: None,
            public_key: None,
            timestamp,
            tx_type: TxType::Coinbase,
        }
    }

    /// Check if this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.tx_type == TxType::Coinbase
    }

    /// Transaction id: SHA-256 over the canonical JSON of every field but
    /// the signature
    pub fn txid(&self) -> Hash {
        let body = json!({
            "sender": self.sender,
            "recipient": self.recipient,
            "amount": self.amount,
            "fee": self.fee,
            "nonce": self.nonce,
            "inputs": self.inputs.iter().map(|i| json!({
                "txid": i.txid.to_hex(),
                "vout": i.vout,
            })).collect::<Vec<_>>(),
            "outputs": self.outputs.iter().map(|o| json!({
                "address": o.address,
                "amount": o.amount,
                "script": o.script,
            })).collect::<Vec<_>>(),
            "public_key": self.public_key.as_ref().map(|k| k.to_hex()),
            "timestamp": self.timestamp,
            "tx_type": self.tx_type.as_str(),
        });
        hash_bytes(canonical_json_value(&body).as_bytes())
    }

    /// The message a signer commits to
    pub fn signing_hash(&self) -> Hash {
        self.txid()
    }

    /// Attach the signer's key and sign
    pub fn sign(&mut self, key: &PrivateKey) {
        self.public_key = Some(key.public_key());
        self.signature = Some(key.sign(&self.signing_hash()));
    }

    /// Builder form of [`Transaction::sign`]
    pub fn signed(mut self, key: &PrivateKey) -> Self {
        self.sign(key);
        self
    }

    /// Verify the attached signature against the attached key
    pub fn verify_signature(&self) -> bool {
        match (&self.public_key, &self.signature) {
            (Some(key), Some(sig)) => key.verify(&self.signing_hash(), sig),
            _ => false,
        }
    }

    /// Sum of outputs, `None` on overflow
    pub fn total_output_value(&self) -> Option<Amount> {
        checked_sum(self.outputs.iter().map(|o| o.amount))
    }

    /// Sum of outputs paying `address`
    pub fn value_to(&self, address: &str) -> Amount {
        self.outputs
            .iter()
            .filter(|o| o.address == address)
            .fold(0u64, |acc, o| acc.saturating_add(o.amount))
    }

    /// Decode a wallet/API transaction
    pub fn from_wire(wire: WireTransaction) -> Result<Self, WireError> {
        let amount = parse_amount(wire.amount).map_err(|e| WireError::Amount("amount", e))?;
        let fee = parse_amount(wire.fee).map_err(|e| WireError::Amount("fee", e))?;

        let outputs = wire
            .outputs
            .into_iter()
            .map(|o| {
                Ok(TxOutput {
                    address: o.address,
                    amount: parse_amount(o.amount).map_err(|e| WireError::Amount("output", e))?,
                    script: o.script,
                })
            })
            .collect::<Result<Vec<_>, WireError>>()?;

        let signature = wire
            .signature
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(SchnorrSignature::from_hex)
            .transpose()?;
        let public_key = wire
            .public_key
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(PublicKey::from_hex)
            .transpose()?;

        Ok(Self {
            sender: wire.sender,
            recipient: wire.recipient,
            amount,
            fee,
            nonce: wire.nonce,
            inputs: wire.inputs,
            outputs,
            signature,
            public_key,
            timestamp: wire.timestamp,
            tx_type: wire.tx_type,
        })
    }
}

/// Errors decoding a [`WireTransaction`]
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid {0}: {1}")]
    Amount(&'static str, AmountError),
    #[error("invalid key material: {0}")]
    Key(#[from] SignatureError),
}

/// Output as wallets send it, amount in coins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOutput {
    pub address: String,
    pub amount: f64,
    #[serde(default)]
    pub script: Option<String>,
}

/// Transaction as wallets and the API layer send it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTransaction {
    pub sender: String,
    pub recipient: String,
    pub amount: f64,
    pub fee: f64,
    pub nonce: u64,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub inputs: Vec<OutPoint>,
    #[serde(default)]
    pub outputs: Vec<WireOutput>,
    pub timestamp: u64,
    #[serde(default)]
    pub tx_type: TxType,
}
