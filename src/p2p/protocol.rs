//! P2P protocol messages
//!
//! JSON messages of the form `{"type": ..., "payload": ...}`. Transport,
//! discovery and gossip live outside this crate; they decode bytes with
//! [`InboundMessage::from_slice`] and hand the result to
//! [`crate::chain::Ledger::handle_message`].

use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointMetadata, CheckpointPayload};
use crate::consensus::Block;
use crate::crypto::Hash;
use crate::error::{LedgerError, ValidationError};
use crate::validation::{Transaction, WireTransaction};

/// Maximum message size (4 MB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Messages a peer may send us
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum InboundMessage {
    /// Full block
    Block(Block),
    /// Transaction in wallet wire format
    Transaction(WireTransaction),
    /// Peer's latest checkpoint
    Checkpoint(CheckpointPayload),
    /// Request data
    GetData(Vec<InvItem>),
    /// Announce blocks or transactions
    Inv(Vec<InvItem>),
}

/// Messages we send back
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum OutboundMessage {
    Block(Block),
    Transaction(Transaction),
    GetData(Vec<InvItem>),
    CheckpointMeta(CheckpointMetadata),
    Reject(RejectMessage),
}

/// Inventory item type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InvType {
    Transaction,
    Block,
}

/// Inventory item (reference to tx or block)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub inv_type: InvType,
    pub hash: Hash,
}

impl InvItem {
    pub fn block(hash: Hash) -> Self {
        Self { inv_type: InvType::Block, hash }
    }

    pub fn transaction(hash: Hash) -> Self {
        Self { inv_type: InvType::Transaction, hash }
    }
}

/// Rejection message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectMessage {
    /// Type of message rejected
    pub message_type: String,
    pub code: RejectCode,
    pub reason: String,
    /// Hash of rejected data (if applicable)
    pub data_hash: Option<Hash>,
}

/// Rejection codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    Malformed,
    Invalid,
    Duplicate,
    Conflict,
    Checkpoint,
    Internal,
}

impl RejectCode {
    /// Classify a ledger error for the peer
    pub fn for_error(error: &LedgerError) -> Self {
        use crate::error::ConflictError;
        match error {
            LedgerError::Validation(ValidationError::Wire(_) | ValidationError::Message(_))
            | LedgerError::Validation(ValidationError::Oversized { .. }) => RejectCode::Malformed,
            LedgerError::Validation(_) | LedgerError::Consensus(_) | LedgerError::Reorg(_) => RejectCode::Invalid,
            LedgerError::Conflict(ConflictError::DuplicateBlock(_) | ConflictError::DuplicateTransaction(_)) => {
                RejectCode::Duplicate
            }
            LedgerError::Conflict(_) => RejectCode::Conflict,
            LedgerError::Checkpoint(_) => RejectCode::Checkpoint,
            LedgerError::Integrity(_) | LedgerError::Storage(_) | LedgerError::Config(_) => RejectCode::Internal,
        }
    }

    /// Misbehavior points a peer earns for sending something rejected
    /// with this code
    pub fn misbehavior(&self) -> u32 {
        match self {
            RejectCode::Malformed => 20,
            RejectCode::Invalid | RejectCode::Checkpoint => 10,
            RejectCode::Duplicate | RejectCode::Conflict | RejectCode::Internal => 0,
        }
    }
}

impl RejectMessage {
    pub fn new(message_type: &str, error: &LedgerError, data_hash: Option<Hash>) -> Self {
        Self {
            message_type: message_type.to_string(),
            code: RejectCode::for_error(error),
            reason: error.to_string(),
            data_hash,
        }
    }
}

impl InboundMessage {
    /// Decode a JSON message, refusing anything over [`MAX_MESSAGE_SIZE`]
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ValidationError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ValidationError::Oversized {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Get the command name for this message
    pub fn command(&self) -> &'static str {
        match self {
            InboundMessage::Block(_) => "block",
            InboundMessage::Transaction(_) => "transaction",
            InboundMessage::Checkpoint(_) => "checkpoint",
            InboundMessage::GetData(_) => "getdata",
            InboundMessage::Inv(_) => "inv",
        }
    }
}
