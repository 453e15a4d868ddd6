//! AtomicXPService (spec §4.6): exactly-once XP award bound to a released
//! escrow. Must run in the same DB transaction as the MoneyStateMachine's
//! `RELEASE_PAYOUT` step 9 — this module never opens its own transaction.

use crate::error::{MoneyError, MoneyResult};
use crate::models::MoneyState;
use crate::xp_math;
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use rust_decimal::prelude::*;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct XpAwardOutcome {
    pub final_xp: i64,
    pub already_awarded: bool,
    pub new_total_xp: i64,
    pub new_level: i16,
    pub new_streak: i32,
}

/// The UTC calendar day a timestamp counts toward for streak purposes: the
/// 2-hour grace period after midnight rolls a late-night completion back
/// onto the previous day (spec §4.6 AUDIT-6), so a 1am finish doesn't reset
/// a streak that was alive at 11pm the night before.
fn effective_streak_day(ts: DateTime<Utc>) -> NaiveDate {
    if ts.time().hour() < 2 {
        (ts - Duration::days(1)).date_naive()
    } else {
        ts.date_naive()
    }
}

fn compute_new_streak(last_active_at: Option<DateTime<Utc>>, current_streak: i32, now: DateTime<Utc>) -> i32 {
    let Some(last) = last_active_at else {
        return 1;
    };
    let last_day = effective_streak_day(last);
    let now_day = effective_streak_day(now);
    let diff_days = (now_day - last_day).num_days();
    match diff_days {
        0 => current_streak.max(1),
        1 => current_streak + 1,
        _ => 1,
    }
}

/// Award XP for `task_id`/`hustler_id`. Requires `money_state_lock.current_state
/// = released` (INV-XP-2); the `xp_ledger.money_state_lock_task_id` UNIQUE
/// constraint gives exactly-once semantics (INV-5) — a second attempt comes
/// back with `already_awarded = true` and no net effect.
pub async fn award_xp_for_task(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
    hustler_id: Uuid,
    price_cents: i64,
    now: DateTime<Utc>,
) -> MoneyResult<XpAwardOutcome> {
    let state: MoneyState =
        sqlx::query_scalar("SELECT current_state FROM money_state_lock WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| MoneyError::NotFound(format!("money_state_lock for {task_id}")))?;
    if state != MoneyState::Released {
        return Err(MoneyError::InvariantViolation(format!(
            "AwardXPForTask requires money_state = released, got {state:?}"
        )));
    }

    let existing = sqlx::query(
        "SELECT final_xp FROM xp_ledger WHERE money_state_lock_task_id = $1",
    )
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(row) = existing {
        let final_xp: i64 = row.get("final_xp");
        let user_row = sqlx::query("SELECT xp, level, streak FROM users WHERE id = $1")
            .bind(hustler_id)
            .fetch_one(&mut **tx)
            .await?;
        return Ok(XpAwardOutcome {
            final_xp,
            already_awarded: true,
            new_total_xp: user_row.get("xp"),
            new_level: user_row.get("level"),
            new_streak: user_row.get("streak"),
        });
    }

    let user_row = sqlx::query(
        "SELECT xp, streak, last_active_at FROM users WHERE id = $1 FOR UPDATE",
    )
    .bind(hustler_id)
    .fetch_one(&mut **tx)
    .await?;
    let current_xp: i64 = user_row.get("xp");
    let current_streak: i32 = user_row.get("streak");
    let last_active_at: Option<DateTime<Utc>> = user_row.get("last_active_at");

    let new_streak = compute_new_streak(last_active_at, current_streak, now);

    let base = xp_math::base_xp(price_cents);
    let decay = xp_math::decay_factor(current_xp);
    let effective = xp_math::effective_xp(base, decay);
    let multiplier = xp_math::streak_multiplier(new_streak);
    let final_xp = xp_math::final_xp(effective, multiplier);

    let inserted = sqlx::query(
        "INSERT INTO xp_ledger
            (user_id, task_id, money_state_lock_task_id, base_xp, decay_factor,
             effective_xp, streak_multiplier, final_xp, reason)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (money_state_lock_task_id) DO NOTHING",
    )
    .bind(hustler_id)
    .bind(task_id)
    .bind(task_id)
    .bind(base)
    .bind(decay)
    .bind(effective)
    .bind(multiplier)
    .bind(final_xp)
    .bind("task_release")
    .execute(&mut **tx)
    .await?;

    if inserted.rows_affected() == 0 {
        // Lost a race with a concurrent awarder between our existence check
        // and this insert; the UNIQUE constraint is the real guard (INV-5).
        let row = sqlx::query(
            "SELECT final_xp FROM xp_ledger WHERE money_state_lock_task_id = $1",
        )
        .bind(task_id)
        .fetch_one(&mut **tx)
        .await?;
        let user_row = sqlx::query("SELECT xp, level, streak FROM users WHERE id = $1")
            .bind(hustler_id)
            .fetch_one(&mut **tx)
            .await?;
        return Ok(XpAwardOutcome {
            final_xp: row.get("final_xp"),
            already_awarded: true,
            new_total_xp: user_row.get("xp"),
            new_level: user_row.get("level"),
            new_streak: user_row.get("streak"),
        });
    }

    let new_total_xp = current_xp + final_xp;
    let new_level = xp_math::level_for_xp(new_total_xp);

    sqlx::query(
        "UPDATE users SET xp = $1, level = $2, streak = $3, last_active_at = $4 WHERE id = $5",
    )
    .bind(new_total_xp)
    .bind(new_level)
    .bind(new_streak)
    .bind(now)
    .bind(hustler_id)
    .execute(&mut **tx)
    .await?;

    Ok(XpAwardOutcome {
        final_xp,
        already_awarded: false,
        new_total_xp,
        new_level,
        new_streak,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn same_effective_day_does_not_reincrement() {
        let last = dt(2026, 7, 20, 23);
        let now = dt(2026, 7, 20, 23);
        assert_eq!(compute_new_streak(Some(last), 4, now), 4);
    }

    #[test]
    fn consecutive_day_increments() {
        let last = dt(2026, 7, 20, 10);
        let now = dt(2026, 7, 21, 10);
        assert_eq!(compute_new_streak(Some(last), 4, now), 5);
    }

    #[test]
    fn grace_window_treats_1am_as_previous_day() {
        // Active at 11pm on day 20; completes at 1am on day 22 (which the
        // grace window maps back onto day 21) -> still consecutive.
        let last = dt(2026, 7, 20, 23);
        let now = dt(2026, 7, 22, 1);
        assert_eq!(compute_new_streak(Some(last), 4, now), 5);
    }

    #[test]
    fn gap_of_two_days_resets_streak() {
        let last = dt(2026, 7, 18, 10);
        let now = dt(2026, 7, 21, 10);
        assert_eq!(compute_new_streak(Some(last), 9, now), 1);
    }

    #[test]
    fn no_prior_activity_starts_streak_at_one() {
        assert_eq!(compute_new_streak(None, 0, dt(2026, 7, 20, 10)), 1);
    }
}
