//! Difficulty engine: the expected compact target for each block height.
//!
//! The rules form a ladder; the first one that fires decides the target:
//! maximum target for the first blocks, the cw-144 continuous adjustment
//! once its median-time gate has passed, the emergency adjustment when six
//! blocks took twelve hours, the original 2016-block retarget on period
//! boundaries, and otherwise the previous block's bits.
//!
//! The engine is a pure function of the block statistics; nothing is
//! mutated until the block under validation commits.

use crate::constants::{
    DAA_ACTIVATION_MTP, DAA_WINDOW, EDA_TIMESPAN, MAX_TARGET_BITS, RETARGET_INTERVAL,
    RETARGET_TIMESPAN, TARGET_SPACING,
};
use crate::error::Result;
use crate::pow::{compress_target, expand_compact, U256};
use crate::stats::BlockStats;
use crate::types::Network;
use log::debug;

pub struct DifficultyEngine {
    network: Network,
    /// Ceiling on the target in compact form. The network constant in
    /// production; tests lower difficulty by raising it.
    max_bits: u32,
}

impl DifficultyEngine {
    pub fn new(network: Network, max_bits: u32) -> Self {
        DifficultyEngine { network, max_bits }
    }

    pub fn max_target_bits(&self) -> u32 {
        self.max_bits
    }

    /// The compact target a block at `height` must carry, given the stats
    /// of the chain below it. `cash_active` reflects the fork ladder at
    /// `height`.
    pub fn expected_target_bits(
        &self,
        height: u32,
        stats: &BlockStats,
        cash_active: bool,
    ) -> Result<u32> {
        if height == 0 {
            // Genesis always carries the network maximum
            return Ok(MAX_TARGET_BITS);
        }
        if height == 1 {
            return Ok(self.max_bits);
        }

        if cash_active && height > DAA_WINDOW + 2 {
            let anchor_mtp = stats.median_time_past(height - 1)?;
            if anchor_mtp > DAA_ACTIVATION_MTP {
                return self.continuous_adjustment(height, stats);
            }
        }

        if cash_active && height > 7 {
            let recent_mtp = stats.median_time_past(height - 1)?;
            let older_mtp = stats.median_time_past(height - 7)?;
            if recent_mtp.saturating_sub(older_mtp) >= EDA_TIMESPAN {
                return self.emergency_adjustment(height, stats);
            }
        }

        if height % RETARGET_INTERVAL == 0 {
            return self.periodic_retarget(height, stats);
        }

        stats.target_bits(height - 1)
    }

    /// Testnet permits a minimum-difficulty block when twenty minutes have
    /// passed since the previous block.
    pub fn allows_min_difficulty(
        &self,
        height: u32,
        block_time: u32,
        stats: &BlockStats,
    ) -> bool {
        if self.network != Network::Testnet || height == 0 {
            return false;
        }
        match stats.time(height - 1) {
            Ok(previous_time) => block_time >= previous_time + 2 * TARGET_SPACING,
            Err(_) => false,
        }
    }

    /// cw-144: project the work rate of the last 144 blocks onto the
    /// target spacing.
    fn continuous_adjustment(&self, height: u32, stats: &BlockStats) -> Result<u32> {
        let (last_time, last_work) = stats.suitable_block(height - 1)?;
        let (first_time, first_work) = stats.suitable_block(height - 1 - DAA_WINDOW)?;

        let min_span = (DAA_WINDOW / 2 * TARGET_SPACING) as u64;
        let max_span = (DAA_WINDOW * 2 * TARGET_SPACING) as u64;
        let time_span =
            (last_time.saturating_sub(first_time) as u64).clamp(min_span, max_span);

        let window_work = match last_work.checked_sub(&first_work) {
            Some(work) if !work.is_zero() => work,
            _ => {
                return Err(crate::error::ChainError::Integrity(
                    "no accumulated work across adjustment window".into(),
                ))
            }
        };

        let projected = match window_work.checked_mul_u64(TARGET_SPACING as u64) {
            Some(scaled) => scaled.div_u64(time_span),
            None => return Ok(self.max_bits),
        };
        if projected.is_zero() {
            return Ok(self.max_bits);
        }

        // target = (2^256 - work) / work
        let target = projected.wrapping_neg().div(&projected);
        Ok(self.clamp_to_max(target))
    }

    /// Emergency adjustment: ease the target by a quarter.
    fn emergency_adjustment(&self, height: u32, stats: &BlockStats) -> Result<u32> {
        let previous_bits = stats.target_bits(height - 1)?;
        let previous = expand_compact(previous_bits)?;
        let eased = previous.wrapping_add(&previous.shr(2));
        let bits = self.clamp_to_max(eased);
        debug!(
            "emergency difficulty adjustment at height {height}: {previous_bits:08x} -> {bits:08x}"
        );
        Ok(bits)
    }

    /// Original 2016-block retarget, carrying the historical one-block
    /// skew: the measured span covers 2015 intervals.
    fn periodic_retarget(&self, height: u32, stats: &BlockStats) -> Result<u32> {
        let last_time = stats.time(height - 1)?;
        let first_time = stats.time(height - RETARGET_INTERVAL)?;
        let time_span = (last_time.saturating_sub(first_time) as u64)
            .clamp(RETARGET_TIMESPAN as u64 / 4, RETARGET_TIMESPAN as u64 * 4);

        let previous_bits = stats.target_bits(height - 1)?;
        let previous = expand_compact(previous_bits)?;
        let adjusted = match previous.checked_mul_u64(time_span) {
            Some(scaled) => scaled.div_u64(RETARGET_TIMESPAN as u64),
            None => return Ok(self.max_bits),
        };
        let bits = self.clamp_to_max(adjusted);
        debug!(
            "retarget at height {height}: span {time_span}s, {previous_bits:08x} -> {bits:08x}"
        );
        Ok(bits)
    }
}

impl DifficultyEngine {
    fn clamp_to_max(&self, target: U256) -> u32 {
        let ceiling = expand_compact(self.max_bits).expect("max bits are canonical");
        if target > ceiling {
            self.max_bits
        } else {
            compress_target(&target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_TARGET_BITS;

    fn engine() -> DifficultyEngine {
        DifficultyEngine::new(Network::Mainnet, MAX_TARGET_BITS)
    }

    fn stats_with_spacing(count: u32, spacing: u32, bits: u32) -> BlockStats {
        let mut stats = BlockStats::new();
        for i in 0..count {
            stats.push(1, 1_000_000 + i * spacing, bits).unwrap();
        }
        stats
    }

    #[test]
    fn first_blocks_use_max_target() {
        let stats = BlockStats::new();
        assert_eq!(engine().expected_target_bits(0, &stats, false).unwrap(), MAX_TARGET_BITS);
        assert_eq!(engine().expected_target_bits(1, &stats, false).unwrap(), MAX_TARGET_BITS);
    }

    #[test]
    fn off_boundary_inherits_previous_bits() {
        let stats = stats_with_spacing(10, 600, 0x1c7fffff);
        assert_eq!(engine().expected_target_bits(10, &stats, false).unwrap(), 0x1c7fffff);
    }

    #[test]
    fn retarget_keeps_bits_when_on_schedule() {
        // Exactly 600 s per block: factor 2015/2016, nearly unchanged
        let stats = stats_with_spacing(2016, 600, 0x1c100000);
        let bits = engine().expected_target_bits(2016, &stats, false).unwrap();
        let before = expand_compact(0x1c100000).unwrap();
        let after = expand_compact(bits).unwrap();
        assert!(after <= before);
        let lower_bound = before.checked_mul_u64(2014).unwrap().div_u64(2016);
        assert!(after >= lower_bound);
    }

    #[test]
    fn retarget_clamps_fast_chain() {
        // Blocks every 60 s: unclamped factor would be ~0.1, clamps to 0.25
        let stats = stats_with_spacing(2016, 60, 0x1c100000);
        let bits = engine().expected_target_bits(2016, &stats, false).unwrap();
        let before = expand_compact(0x1c100000).unwrap();
        let quarter = before.div_u64(4);
        let after = expand_compact(bits).unwrap();
        // Within compact-precision rounding of a quarter
        assert!(after <= quarter);
        assert!(after >= quarter.checked_mul_u64(99).unwrap().div_u64(100));
    }

    #[test]
    fn retarget_clamps_slow_chain_to_max() {
        let stats = stats_with_spacing(2016, 6000, MAX_TARGET_BITS);
        let bits = engine().expected_target_bits(2016, &stats, false).unwrap();
        assert_eq!(bits, MAX_TARGET_BITS);
    }

    #[test]
    fn emergency_adjustment_fires_after_twelve_idle_hours() {
        let mut stats = BlockStats::new();
        for i in 0..20u32 {
            stats.push(1, 1_000_000 + i * 600, 0x1c100000).unwrap();
        }
        // Six slow blocks spread over far more than twelve hours
        for i in 0..8u32 {
            stats.push(1, 1_020_000 + i * 30_000, 0x1c100000).unwrap();
        }
        let height = stats.tip_height().unwrap() + 1;
        let bits = engine().expected_target_bits(height, &stats, true).unwrap();
        let before = expand_compact(0x1c100000).unwrap();
        let after = expand_compact(bits).unwrap();
        assert!(after > before);
        // Eased by one quarter
        assert_eq!(after, before.wrapping_add(&before.shr(2)));
    }

    #[test]
    fn eda_needs_cash_active() {
        let mut stats = BlockStats::new();
        for i in 0..28u32 {
            stats.push(1, 1_000_000 + i * 30_000, 0x1c100000).unwrap();
        }
        let height = stats.tip_height().unwrap() + 1;
        let bits = engine().expected_target_bits(height, &stats, false).unwrap();
        assert_eq!(bits, 0x1c100000);
    }

    #[test]
    fn continuous_adjustment_steady_state_holds_target() {
        // 200 blocks past the MTP gate at ideal spacing
        let mut stats = BlockStats::new();
        for i in 0..200u32 {
            stats.push(1, DAA_ACTIVATION_MTP + 1000 + i * 600, 0x1c100000).unwrap();
        }
        let height = stats.tip_height().unwrap() + 1;
        let bits = engine().expected_target_bits(height, &stats, true).unwrap();
        let before = expand_compact(0x1c100000).unwrap();
        let after = expand_compact(bits).unwrap();
        // Steady spacing keeps the target within compact rounding
        let tolerance = before.div_u64(128);
        assert!(after <= before.wrapping_add(&tolerance));
        assert!(after >= before.checked_sub(&tolerance).unwrap());
    }

    #[test]
    fn continuous_adjustment_eases_after_slowdown() {
        let mut stats = BlockStats::new();
        for i in 0..150u32 {
            stats.push(1, DAA_ACTIVATION_MTP + 1000 + i * 600, 0x1c100000).unwrap();
        }
        // 60 blocks at double spacing
        let mut time = DAA_ACTIVATION_MTP + 1000 + 150 * 600;
        for _ in 0..60u32 {
            time += 1200;
            stats.push(1, time, 0x1c100000).unwrap();
        }
        let height = stats.tip_height().unwrap() + 1;
        let bits = engine().expected_target_bits(height, &stats, true).unwrap();
        let before = expand_compact(0x1c100000).unwrap();
        let after = expand_compact(bits).unwrap();
        assert!(after > before);
    }

    #[test]
    fn testnet_minimum_difficulty_window() {
        let testnet = DifficultyEngine::new(Network::Testnet, MAX_TARGET_BITS);
        let stats = stats_with_spacing(5, 600, MAX_TARGET_BITS);
        let previous_time = stats.time(4).unwrap();
        assert!(testnet.allows_min_difficulty(5, previous_time + 1200, &stats));
        assert!(!testnet.allows_min_difficulty(5, previous_time + 1199, &stats));
        assert!(!engine().allows_min_difficulty(5, previous_time + 9999, &stats));
    }
}
