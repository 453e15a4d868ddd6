//! Injected fee schedule (spec §9 Open Question): the exact fee split is a
//! policy input, not ledger logic. The money engine only ever calls
//! `FeeFor`, so tiered/boosted pricing can change without touching
//! `money_state_machine.rs` or `ledger.rs`.

use crate::models::Task;

/// Context available when computing a fee; kept narrow on purpose so the
/// core never needs to widen its surface for a pricing experiment.
pub struct FeeContext<'a> {
    pub task: &'a Task,
}

pub trait FeeSchedule: Send + Sync {
    /// Returns the platform's cut, in cents, of `task.price_cents`. Must be
    /// in `[0, task.price_cents]`.
    fn fee_for(&self, ctx: &FeeContext<'_>) -> i64;
}

/// Flat basis-point fee; the default used throughout the spec's worked
/// examples (12% = 1200 bps).
pub struct FlatFee {
    pub bps: u32,
}

impl FeeSchedule for FlatFee {
    fn fee_for(&self, ctx: &FeeContext<'_>) -> i64 {
        let fee = (ctx.task.price_cents as i128 * self.bps as i128) / 10_000;
        fee.clamp(0, ctx.task.price_cents as i128) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn task_with_price(price_cents: i64) -> Task {
        Task {
            id: Uuid::new_v4(),
            poster_id: Uuid::new_v4(),
            hustler_id: None,
            price_cents,
            status: TaskStatus::Open,
            category: "general".into(),
            created_at: Utc::now(),
            accepted_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn flat_fee_is_twelve_percent_of_five_thousand() {
        let task = task_with_price(5000);
        let fee = FlatFee { bps: 1200 };
        let ctx = FeeContext { task: &task };
        assert_eq!(fee.fee_for(&ctx), 600);
    }
}
