//! Difficulty adjustment algorithm
//!
//! Difficulty is a count of required leading zero bits. It moves only at
//! retarget heights, by the ratio of target to observed time over the
//! previous window, clamped to `max_adjustment_factor` either way.

use crate::config::ConsensusParams;
use crate::constants::MAX_DIFFICULTY;

/// Check if difficulty should be adjusted at this height
pub fn should_adjust_difficulty(height: u64, interval: u64) -> bool {
    height > 0 && interval > 0 && height % interval == 0
}

/// First height of the window that feeds the retarget at `height`
pub fn get_period_start_height(height: u64, interval: u64) -> u64 {
    height.saturating_sub(interval)
}

/// Make timestamps non-decreasing by carrying the running maximum forward.
/// A header that claims an earlier time than its ancestors cannot shrink
/// the measured window.
pub fn sanitize_timestamps(timestamps: &[u64]) -> Vec<u64> {
    let mut max_seen = 0u64;
    timestamps
        .iter()
        .map(|&t| {
            max_seen = max_seen.max(t);
            max_seen
        })
        .collect()
}

/// Calculate the retargeted difficulty from a window of block timestamps
///
/// `window` holds the timestamps of the blocks in the period, oldest first.
pub fn calculate_next_difficulty(old: u32, window: &[u64], params: &ConsensusParams) -> u32 {
    let sanitized = sanitize_timestamps(window);
    let (Some(first), Some(last)) = (sanitized.first(), sanitized.last()) else {
        return apply_cap(old, params);
    };

    let spans = (sanitized.len() as u64).saturating_sub(1).max(1);
    let target_time = params.target_block_time.saturating_mul(spans).max(1) as u128;
    let actual_time = (last - first).max(1) as u128;

    let factor = params.max_adjustment_factor.max(1) as u128;
    let old_wide = old as u128;
    let lower = (old_wide / factor).max(1);
    let upper = old_wide.saturating_mul(factor).max(lower);

    let next = (old_wide * target_time / actual_time).clamp(lower, upper).max(1);
    let next = next.min(MAX_DIFFICULTY as u128) as u32;
    apply_cap(next, params)
}

/// Clamp to the configured mining cap, never below 1
pub fn apply_cap(difficulty: u32, params: &ConsensusParams) -> u32 {
    let capped = match params.difficulty_cap() {
        Some(cap) => difficulty.min(cap),
        None => difficulty,
    };
    capped.max(1)
}

/// Difficulty a block at `height` must carry
///
/// `window` is only consulted at retarget heights.
pub fn expected_difficulty(
    height: u64,
    parent_difficulty: u32,
    window: &[u64],
    params: &ConsensusParams,
) -> u32 {
    if should_adjust_difficulty(height, params.adjustment_interval) {
        calculate_next_difficulty(parent_difficulty, window, params)
    } else {
        apply_cap(parent_difficulty, params)
    }
}

/// Difficulty of the genesis block and the first period
pub fn genesis_difficulty(params: &ConsensusParams) -> u32 {
    apply_cap(params.initial_difficulty, params)
}
