//! Fixed-point XP math (spec §4.6). Uses `rust_decimal` at 20-digit
//! precision with truncating rounding throughout, to avoid the floating
//! point drift the spec explicitly calls out (spec §9).

use rust_decimal::prelude::*;
use rust_decimal::MathematicalOps;
use rust_decimal_macros::dec;

/// Cumulative XP required to reach level N (index 0 = level 1's floor).
pub const LEVEL_THRESHOLDS: [i64; 10] = [0, 100, 300, 700, 1500, 2700, 4500, 7000, 10500, 18500];

pub fn base_xp(price_cents: i64) -> i64 {
    (price_cents / 100).max(10)
}

/// `1 / (1 + log10(1 + total_xp / 1000))`, floored to 4 decimal places.
pub fn decay_factor(total_xp: i64) -> Decimal {
    let total_xp = Decimal::from(total_xp.max(0));
    let arg = Decimal::ONE + total_xp / dec!(1000);
    let log10_arg = arg.ln() / Decimal::from(10u8).ln();
    let denom = Decimal::ONE + log10_arg;
    let raw = Decimal::ONE / denom;
    truncate4(raw)
}

pub fn effective_xp(base: i64, decay: Decimal) -> i64 {
    (Decimal::from(base) * decay).trunc().to_i64().unwrap_or(0)
}

/// Streak multiplier tiers, keyed by the *new* streak length in days
/// (spec §4.6).
pub fn streak_multiplier(new_streak_days: i32) -> Decimal {
    match new_streak_days {
        i32::MIN..=2 => dec!(1.0),
        3..=6 => dec!(1.1),
        7..=13 => dec!(1.2),
        14..=29 => dec!(1.3),
        _ => dec!(1.5),
    }
}

pub fn final_xp(effective: i64, multiplier: Decimal) -> i64 {
    (Decimal::from(effective) * multiplier).trunc().to_i64().unwrap_or(0)
}

/// Level for a given cumulative XP total: the highest threshold index whose
/// value is <= total_xp, 1-indexed.
pub fn level_for_xp(total_xp: i64) -> i16 {
    let mut level = 1i16;
    for (i, threshold) in LEVEL_THRESHOLDS.iter().enumerate() {
        if total_xp >= *threshold {
            level = (i + 1) as i16;
        }
    }
    level
}

fn truncate4(d: Decimal) -> Decimal {
    d.trunc_with_scale(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_xp_has_a_floor_of_ten() {
        assert_eq!(base_xp(500), 10);
        assert_eq!(base_xp(5000), 50);
        assert_eq!(base_xp(250_000), 2500);
    }

    #[test]
    fn decay_factor_is_one_at_zero_xp() {
        assert_eq!(decay_factor(0), dec!(1.0000));
    }

    #[test]
    fn worked_example_matches_spec_scenario_one() {
        // price $50.00, H.total_xp = 0 before this award.
        let base = base_xp(5000);
        assert_eq!(base, 50);
        let decay = decay_factor(0);
        assert_eq!(decay, dec!(1.0000));
        let effective = effective_xp(base, decay);
        assert_eq!(effective, 50);
        let multiplier = streak_multiplier(1);
        assert_eq!(multiplier, dec!(1.0));
        let total = final_xp(effective, multiplier);
        assert_eq!(total, 50);
        assert_eq!(level_for_xp(50), 1);
    }

    #[test]
    fn streak_multiplier_tiers_match_spec_table() {
        assert_eq!(streak_multiplier(1), dec!(1.0));
        assert_eq!(streak_multiplier(2), dec!(1.0));
        assert_eq!(streak_multiplier(3), dec!(1.1));
        assert_eq!(streak_multiplier(6), dec!(1.1));
        assert_eq!(streak_multiplier(7), dec!(1.2));
        assert_eq!(streak_multiplier(13), dec!(1.2));
        assert_eq!(streak_multiplier(14), dec!(1.3));
        assert_eq!(streak_multiplier(29), dec!(1.3));
        assert_eq!(streak_multiplier(30), dec!(1.5));
        assert_eq!(streak_multiplier(365), dec!(1.5));
    }

    #[test]
    fn level_thresholds_are_cumulative() {
        assert_eq!(level_for_xp(0), 1);
        assert_eq!(level_for_xp(99), 1);
        assert_eq!(level_for_xp(100), 2);
        assert_eq!(level_for_xp(18500), 10);
        assert_eq!(level_for_xp(999_999), 10);
    }
}
