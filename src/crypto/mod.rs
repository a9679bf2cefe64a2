//! Cryptography module - SHA-256 hashing, canonical JSON, Schnorr signatures, Merkle trees

mod hash;
mod canonical;
mod schnorr;
mod merkle;

pub use hash::*;
pub use canonical::*;
pub use schnorr::*;
pub use merkle::*;
