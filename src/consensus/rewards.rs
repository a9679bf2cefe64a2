//! Block reward calculation
//!
//! Halving schedule: `initial_reward >> (height / halving_interval)`, never
//! more than what is left under `max_supply`.

use crate::config::ConsensusParams;
use crate::validation::Amount;

/// Scheduled reward for a block at `height`, ignoring the supply cap
pub fn scheduled_reward(height: u64, params: &ConsensusParams) -> Amount {
    let halvings = height / params.halving_interval.max(1);
    if halvings >= 64 {
        return 0;
    }
    params.initial_reward >> halvings
}

/// Calculate block reward for a given height
///
/// `circulating` is the supply before this block. Once it reaches
/// `max_supply` the reward is 0 and miners live on fees.
pub fn calculate_block_reward(height: u64, circulating: Amount, params: &ConsensusParams) -> Amount {
    let remaining = params.max_supply.saturating_sub(circulating);
    scheduled_reward(height, params).min(remaining)
}

/// Total issued by the schedule through `up_to_height`, ignoring fees
pub fn calculate_total_issued(up_to_height: u64, params: &ConsensusParams) -> Amount {
    let mut total: Amount = 0;
    for height in 0..=up_to_height {
        let reward = calculate_block_reward(height, total, params);
        if reward == 0 && total >= params.max_supply {
            break;
        }
        total = total.saturating_add(reward);
    }
    total
}
