//! Kill-Switch (spec §4.9): a single-row flag, checked after any row lock
//! is acquired so in-flight transactions finish but new ones stop cold. An
//! operator override in `Config` always wins over the DB row, so the
//! platform can be stopped even if the DB itself is suspect.

use crate::config::Config;
use crate::error::{MoneyError, MoneyResult};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct KillSwitchState {
    pub active: bool,
    pub reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub activated_by: Option<String>,
}

/// Reads the single-row `kill_switch` table. Every caller of `handle()`
/// calls this before taking any lock (spec §4.4 step 2); callers holding a
/// row lock already re-derive the same answer implicitly, since a flip
/// mid-transaction only blocks the *next* caller, never the current one.
pub async fn current_state(pool: &PgPool) -> MoneyResult<KillSwitchState> {
    let row = sqlx::query(
        "SELECT active, reason, activated_at, activated_by FROM kill_switch WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(match row {
        Some(row) => KillSwitchState {
            active: row.get("active"),
            reason: row.get("reason"),
            activated_at: row.get("activated_at"),
            activated_by: row.get("activated_by"),
        },
        None => KillSwitchState {
            active: false,
            reason: None,
            activated_at: None,
            activated_by: None,
        },
    })
}

/// Fails fast with `BlockedByKillSwitch` if either the DB row or the static
/// config override says the platform is stopped.
pub async fn assert_not_blocked(pool: &PgPool) -> MoneyResult<()> {
    let state = current_state(pool).await?;
    if state.active {
        return Err(MoneyError::BlockedByKillSwitch {
            reason: state.reason.unwrap_or_else(|| "kill switch active".into()),
        });
    }
    Ok(())
}

pub fn assert_not_overridden(config: &Config) -> MoneyResult<()> {
    if config.kill_switch_override {
        return Err(MoneyError::BlockedByKillSwitch {
            reason: "operator override (KILL_SWITCH_OVERRIDE) is set".into(),
        });
    }
    Ok(())
}

/// Activates the kill-switch. Called by the Reconciler on ledger drift
/// (spec §4.9 "this itself triggers the kill-switch") or by an admin action.
pub async fn activate(pool: &PgPool, reason: &str, activated_by: &str) -> MoneyResult<()> {
    tracing::error!(reason, activated_by, "kill-switch activated");
    sqlx::query(
        "INSERT INTO kill_switch (id, active, reason, activated_at, activated_by)
         VALUES (1, true, $1, now(), $2)
         ON CONFLICT (id) DO UPDATE
            SET active = true, reason = $1, activated_at = now(), activated_by = $2",
    )
    .bind(reason)
    .bind(activated_by)
    .execute(pool)
    .await?;
    Ok(())
}

/// Deactivation is deliberately a distinct, explicitly-named function (never
/// implicit, never automatic) — it is an admin action per spec §4.9/§4.11,
/// recorded in `admin_actions` by the caller.
pub async fn deactivate(pool: &PgPool, deactivated_by: &str) -> MoneyResult<()> {
    tracing::warn!(deactivated_by, "kill-switch deactivated");
    sqlx::query(
        "UPDATE kill_switch SET active = false, reason = NULL, activated_at = NULL,
                activated_by = NULL
         WHERE id = 1",
    )
    .execute(pool)
    .await?;
    Ok(())
}
