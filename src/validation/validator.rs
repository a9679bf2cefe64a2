//! Transaction validation
//!
//! [`validate_transaction`] is a pure function of the transaction, a UTXO
//! view and a nonce view. Two ledgers holding the same state always reach
//! the same verdict for the same transaction.

use std::collections::HashSet;
use thiserror::Error;

use crate::constants::MAX_SCRIPT_LEN;
use crate::crypto::{is_valid_address, Hash};
use crate::storage::{Utxo, UtxoView};
use super::amount::{checked_sum, Amount};
use super::nonce::{NonceError, NonceView};
use super::transaction::{OutPoint, Transaction};

/// Policy knobs that are not part of the transaction itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationRules {
    pub min_fee: Amount,
}

/// How a rejection should be treated by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Malformed or out of range; drop it
    Validation,
    /// Double-spend or replay
    Conflict,
    /// References outputs not seen yet; may become valid later
    Orphan,
}

/// Transaction rejection reasons
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxRejection {
    #[error("coinbase transactions are only valid inside a block")]
    CoinbaseNotAllowed,
    #[error("zero amount requires a non-zero fee")]
    ZeroAmount,
    #[error("fee {fee} below minimum {min_fee}")]
    FeeTooLow { fee: Amount, min_fee: Amount },
    #[error("missing public key or signature")]
    MissingSignature,
    #[error("sender {sender} does not match public key address {derived}")]
    SenderMismatch { sender: String, derived: String },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("output {index} invalid: {reason}")]
    InvalidOutput { index: usize, reason: &'static str },
    #[error("transaction has no inputs")]
    NoInputs,
    #[error("input {0} listed twice")]
    DuplicateInput(OutPoint),
    #[error("input {0} not found")]
    MissingInput(OutPoint),
    #[error("input {0} already spent")]
    AlreadySpent(OutPoint),
    #[error("input {outpoint} owned by {owner}, not the sender")]
    NotOwner { outpoint: OutPoint, owner: String },
    #[error("inputs {available} cannot cover amount plus fee {required}")]
    InsufficientFunds { available: Amount, required: Amount },
    #[error("inputs {inputs} != outputs {outputs} + fee {fee}")]
    Unbalanced { inputs: Amount, outputs: Amount, fee: Amount },
    #[error("recipient receives {paid}, transaction states {amount}")]
    RecipientUnderpaid { paid: Amount, amount: Amount },
    #[error("amount overflow")]
    Overflow,
    #[error(transparent)]
    Nonce(#[from] NonceError),
}

impl TxRejection {
    pub fn kind(&self) -> RejectionKind {
        match self {
            TxRejection::AlreadySpent(_) | TxRejection::Nonce(NonceError::Replay { .. }) => {
                RejectionKind::Conflict
            }
            TxRejection::MissingInput(_) => RejectionKind::Orphan,
            _ => RejectionKind::Validation,
        }
    }
}

/// Facts established while validating, reused by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTx {
    pub txid: Hash,
    pub input_total: Amount,
    pub fee: Amount,
    pub spent: Vec<(OutPoint, Utxo)>,
}

fn check_script(script: &Option<String>) -> Result<(), &'static str> {
    match script {
        None => Ok(()),
        Some(s) if s.is_empty() => Err("empty script"),
        Some(s) if s.len() > MAX_SCRIPT_LEN => Err("script too long"),
        Some(s) if hex::decode(s).is_err() => Err("script is not hex"),
        Some(_) => Ok(()),
    }
}

/// Validate a non-coinbase transaction against a ledger view
pub fn validate_transaction(
    tx: &Transaction,
    utxos: &dyn UtxoView,
    nonces: &dyn NonceView,
    rules: &ValidationRules,
) -> Result<ValidatedTx, TxRejection> {
    if tx.is_coinbase() {
        return Err(TxRejection::CoinbaseNotAllowed);
    }
    if tx.amount == 0 && tx.fee == 0 {
        return Err(TxRejection::ZeroAmount);
    }
    if tx.fee < rules.min_fee {
        return Err(TxRejection::FeeTooLow {
            fee: tx.fee,
            min_fee: rules.min_fee,
        });
    }

    // Signature
    let (Some(public_key), Some(_)) = (&tx.public_key, &tx.signature) else {
        return Err(TxRejection::MissingSignature);
    };
    let derived = public_key.to_address();
    if derived != tx.sender {
        return Err(TxRejection::SenderMismatch {
            sender: tx.sender.clone(),
            derived,
        });
    }
    if !tx.verify_signature() {
        return Err(TxRejection::InvalidSignature);
    }

    for (index, output) in tx.outputs.iter().enumerate() {
        if !is_valid_address(&output.address) {
            return Err(TxRejection::InvalidOutput { index, reason: "bad address" });
        }
        if output.amount == 0 {
            return Err(TxRejection::InvalidOutput { index, reason: "zero amount" });
        }
        check_script(&output.script).map_err(|reason| TxRejection::InvalidOutput { index, reason })?;
    }

    // Inputs
    if tx.inputs.is_empty() {
        return Err(TxRejection::NoInputs);
    }
    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(*input) {
            return Err(TxRejection::DuplicateInput(*input));
        }
    }

    let mut spent = Vec::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        let utxo = match utxos.utxo(input) {
            Some(utxo) => utxo,
            None if utxos.is_known_tx(&input.txid) => return Err(TxRejection::AlreadySpent(*input)),
            None => return Err(TxRejection::MissingInput(*input)),
        };
        if utxo.address != tx.sender {
            return Err(TxRejection::NotOwner {
                outpoint: *input,
                owner: utxo.address,
            });
        }
        spent.push((*input, utxo));
    }

    // Value
    let input_total = checked_sum(spent.iter().map(|(_, u)| u.amount)).ok_or(TxRejection::Overflow)?;
    let required = tx.amount.checked_add(tx.fee).ok_or(TxRejection::Overflow)?;
    if input_total < required {
        return Err(TxRejection::InsufficientFunds {
            available: input_total,
            required,
        });
    }
    let output_total = tx.total_output_value().ok_or(TxRejection::Overflow)?;
    if output_total.checked_add(tx.fee) != Some(input_total) {
        return Err(TxRejection::Unbalanced {
            inputs: input_total,
            outputs: output_total,
            fee: tx.fee,
        });
    }
    let paid = tx.value_to(&tx.recipient);
    if paid < tx.amount {
        return Err(TxRejection::RecipientUnderpaid {
            paid,
            amount: tx.amount,
        });
    }

    nonces.check_nonce(&tx.sender, tx.nonce)?;

    Ok(ValidatedTx {
        txid: tx.txid(),
        input_total,
        fee: tx.fee,
        spent,
    })
}
