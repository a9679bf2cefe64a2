//! Node bootstrap - per-network genesis

pub mod genesis;

pub use genesis::{allocation_address, create_genesis_block, genesis_hash};
