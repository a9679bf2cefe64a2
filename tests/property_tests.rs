//! Property-based and adversarial tests
//!
//! Invariants that must hold for any input: supply conservation, nonce
//! sequencing, bounded retargets and deterministic hashing.

mod common;

use common::{address, TestNet, ALLOCATION, NOW};
use ledger_core::config::{ConsensusParams, Network};
use ledger_core::consensus::{calculate_block_reward, calculate_next_difficulty, scheduled_reward, BlockHeader};
use ledger_core::constants::MAX_DIFFICULTY;
use ledger_core::crypto::{compute_merkle_root, hash_bytes, Hash};
use ledger_core::validation::{format_amount, parse_amount, NonceTracker, NonceView};
use proptest::prelude::*;

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

proptest! {
    /// Issuance never pushes supply past the cap
    #[test]
    fn prop_supply_never_exceeds_cap(
        circulating in 0u64..=21_000_000 * 100_000_000,
        height in 0u64..10_000_000
    ) {
        let params = ConsensusParams::for_network(Network::Mainnet);
        let reward = calculate_block_reward(height, circulating, &params);
        prop_assert!(circulating.saturating_add(reward) <= params.max_supply.max(circulating));
        prop_assert!(reward <= scheduled_reward(height, &params));
    }

    /// The schedule only ever goes down
    #[test]
    fn prop_schedule_non_increasing(height in 0u64..20_000_000, step in 1u64..1_000_000) {
        let params = ConsensusParams::for_network(Network::Mainnet);
        prop_assert!(scheduled_reward(height + step, &params) <= scheduled_reward(height, &params));
    }

    /// One retarget moves difficulty by at most the configured factor
    #[test]
    fn prop_retarget_bounded(
        old in 1u32..=MAX_DIFFICULTY,
        window in prop::collection::vec(0u64..1_000_000_000, 0..50)
    ) {
        let params = ConsensusParams::for_network(Network::Mainnet);
        let factor = params.max_adjustment_factor as u32;
        let next = calculate_next_difficulty(old, &window, &params);
        prop_assert!(next >= 1 && next <= MAX_DIFFICULTY);
        prop_assert!(next >= (old / factor).max(1));
        prop_assert!(next <= old.saturating_mul(factor));
    }

    /// Only `last + 1` is ever accepted, whatever is thrown at the tracker
    #[test]
    fn prop_nonce_strictly_sequential(attempts in prop::collection::vec(0u64..8, 1..40)) {
        let mut tracker = NonceTracker::new();
        for nonce in attempts {
            let before = tracker.last_nonce("alice");
            let accepted = tracker.check_and_increment("alice", nonce).is_ok();
            prop_assert_eq!(accepted, nonce == before + 1);
            prop_assert_eq!(tracker.last_nonce("alice"), if accepted { nonce } else { before });
        }
    }

    /// Header hashing depends on content only
    #[test]
    fn prop_header_hash_deterministic(
        index in 0u64..1_000_000,
        timestamp in 0u64..u64::MAX,
        difficulty in 1u32..=MAX_DIFFICULTY,
        nonce in 0u64..u64::MAX - 1
    ) {
        let a = BlockHeader::new(index, Hash::zero(), Hash::zero(), timestamp, difficulty, nonce);
        let b = BlockHeader::new(index, Hash::zero(), Hash::zero(), timestamp, difficulty, nonce);
        prop_assert_eq!(a.hash(), b.hash());

        let bumped = BlockHeader::new(index, Hash::zero(), Hash::zero(), timestamp, difficulty, nonce + 1);
        prop_assert_ne!(a.hash(), bumped.hash());
    }

    /// Reordering transactions changes the merkle root
    #[test]
    fn prop_merkle_root_order_sensitive(n in 2u32..40, swap in 0usize..39) {
        let mut leaves: Vec<Hash> = (0..n).map(|i| hash_bytes(&i.to_be_bytes())).collect();
        let root = compute_merkle_root(&leaves);
        let i = swap % (n as usize - 1);
        leaves.swap(i, i + 1);
        prop_assert_ne!(root, compute_merkle_root(&leaves));
    }

    /// Base-unit formatting parses back to the same amount
    #[test]
    fn prop_amount_text_stable(units in 0u64..1_000_000_000_000_000) {
        let text = format_amount(units);
        let coins: f64 = text.parse().unwrap();
        let parsed = parse_amount(coins).unwrap();
        // f64 loses precision above 2^53 base units
        prop_assert!(parsed.abs_diff(units) <= units / (1 << 50) + 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Coins are only created by coinbases: whatever payments confirm, the
    /// UTXO total is the genesis allocation plus every block reward
    #[test]
    fn prop_value_conserved(amounts in prop::collection::vec(1u64..10_000, 1..6)) {
        let net = TestNet::new();
        let ledger = net.ledger();

        let mut prev = None;
        for (i, amount) in amounts.iter().enumerate() {
            let nonce = i as u64 + 1;
            let tx = match &prev {
                None => net.pay_from_genesis(&address(7), *amount, nonce),
                Some(prev) => net.pay_from(prev, 1, &address(7), *amount, nonce),
            };
            ledger.ingest_transaction_at(tx.clone(), NOW).unwrap();
            net.mine_next(&ledger);
            prev = Some(tx);
        }

        let chain = ledger.read_chain();
        let rewards: u64 = (1..=chain.height()).map(|h| scheduled_reward(h, chain.params())).sum();
        prop_assert_eq!(chain.total_supply(), ALLOCATION + rewards);
        prop_assert_eq!(chain.utxos().get_balance(&address(7)), amounts.iter().sum::<u64>());
        prop_assert!(chain.check_integrity().is_ok());
    }
}

// ============================================================================
// ADVERSARIAL TESTS
// ============================================================================

/// Timestamps claiming zero or a century of elapsed time still move
/// difficulty by no more than the clamp
#[test]
fn test_time_warp_clamped() {
    let params = ConsensusParams::for_network(Network::Mainnet);
    let factor = params.max_adjustment_factor as u32;
    let old = 20;

    let instant = vec![1_000; 10];
    assert_eq!(calculate_next_difficulty(old, &instant, &params), old * factor);

    let century: Vec<u64> = (0..10).map(|i| i * 100 * 365 * 24 * 3600).collect();
    assert_eq!(calculate_next_difficulty(old, &century, &params), old / factor);

    // a header claiming to predate its ancestors cannot shrink the window
    let backwards = vec![1_000, 2_000, 0, 3_000];
    let honest = vec![1_000, 2_000, 2_000, 3_000];
    assert_eq!(
        calculate_next_difficulty(old, &backwards, &params),
        calculate_next_difficulty(old, &honest, &params)
    );
}

/// A block spending the same output twice never connects
#[test]
fn test_double_spend_in_block_rejected() {
    use common::mine;
    use ledger_core::consensus::{Block, ConsensusViolation};
    use ledger_core::error::LedgerError;
    use ledger_core::validation::Transaction;

    let net = TestNet::new();
    let ledger = net.ledger();
    let first = net.pay_from_genesis(&address(7), 100, 1);
    let second = net.pay_from_genesis(&address(8), 200, 2);

    let tip = *ledger.read_chain().tip();
    let reward = ledger.read_chain().next_reward();
    let coinbase = Transaction::coinbase(net.miner.clone(), reward + 2, 1, NOW);
    let mut block = Block::new(1, tip.hash, NOW, 1, vec![coinbase, first, second]);
    mine(&mut block.header);

    let err = ledger.ingest_block_at(block, NOW).unwrap_err();
    assert!(
        matches!(err, LedgerError::Consensus(ConsensusViolation::DoubleSpend(_))),
        "{err}"
    );
    assert_eq!(ledger.height(), 0);
    assert_eq!(ledger.compute_state_snapshot().utxo_digest, net.ledger().compute_state_snapshot().utxo_digest);
}
