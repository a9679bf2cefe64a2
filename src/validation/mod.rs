//! Transaction model and admission rules
//!
//! Everything here is independent of block structure: amounts, the
//! transaction type, the per-sender nonce gate and the pure validator.

pub mod amount;
pub mod nonce;
pub mod transaction;
pub mod validator;

pub use amount::{checked_sum, format_amount, parse_amount, Amount, AmountError};
pub use nonce::{LayeredNonces, NonceError, NonceSnapshot, NonceTracker, NonceView};
pub use transaction::{OutPoint, Transaction, TxOutput, TxType, WireError, WireOutput, WireTransaction};
pub use validator::{validate_transaction, RejectionKind, TxRejection, ValidatedTx, ValidationRules};
