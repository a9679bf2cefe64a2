//! Genesis block generation
//!
//! One reproducible genesis per network. The coinbase pays the height-0
//! reward to a fixed allocation address derived from the network name; no
//! key for it exists, so the allocation is effectively burned.

use crate::config::{ConsensusParams, Network};
use crate::consensus::{genesis_difficulty, scheduled_reward, Block};
use crate::crypto::{hash_bytes, Hash, PublicKey};
use crate::validation::Transaction;

const MAINNET_TIMESTAMP: u64 = 1_704_067_200;
const TESTNET_TIMESTAMP: u64 = 1_704_153_600;
const REGTEST_TIMESTAMP: u64 = 1_704_240_000;

fn genesis_timestamp(network: Network) -> u64 {
    match network {
        Network::Mainnet => MAINNET_TIMESTAMP,
        Network::Testnet => TESTNET_TIMESTAMP,
        Network::Regtest => REGTEST_TIMESTAMP,
    }
}

/// Address credited by the genesis coinbase
pub fn allocation_address(network: Network) -> String {
    let seed = format!("ledger-core/{network:?}/genesis-allocation");
    PublicKey(hash_bytes(seed.as_bytes()).0).to_address()
}

/// Create the genesis block
///
/// Byte-for-byte identical for identical parameters. The header is not
/// mined: genesis is trusted, never validated.
pub fn create_genesis_block(params: &ConsensusParams) -> Block {
    let timestamp = genesis_timestamp(params.network);
    let coinbase = Transaction::coinbase(
        allocation_address(params.network),
        scheduled_reward(0, params),
        0,
        timestamp,
    );
    Block::new(0, Hash::zero(), timestamp, genesis_difficulty(params), vec![coinbase])
}

/// Get genesis block hash
pub fn genesis_hash(params: &ConsensusParams) -> Hash {
    create_genesis_block(params).hash()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::is_valid_address;

    #[test]
    fn test_genesis_is_deterministic() {
        let params = ConsensusParams::for_network(Network::Mainnet);
        assert_eq!(create_genesis_block(&params), create_genesis_block(&params));
        assert_eq!(genesis_hash(&params), genesis_hash(&params));
    }

    #[test]
    fn test_networks_differ() {
        let main = genesis_hash(&ConsensusParams::for_network(Network::Mainnet));
        let test = genesis_hash(&ConsensusParams::for_network(Network::Testnet));
        assert_ne!(main, test);
        assert_ne!(allocation_address(Network::Mainnet), allocation_address(Network::Regtest));
    }

    #[test]
    fn test_genesis_shape() {
        let params = ConsensusParams::for_network(Network::Regtest);
        let genesis = create_genesis_block(&params);
        assert!(genesis.is_genesis());
        assert!(genesis.has_valid_merkle_root());

        let coinbase = genesis.coinbase().unwrap();
        assert_eq!(coinbase.nonce, 0);
        assert_eq!(coinbase.total_output_value(), Some(params.initial_reward));
        assert!(is_valid_address(&coinbase.recipient));
    }
}
