//! Append-only audit trails: `money_events_audit`, `trust_ledger`,
//! `badge_ledger`, `admin_actions`. Each table is append-only at the DB
//! layer (a `BEFORE DELETE/UPDATE` trigger raises); these helpers are the
//! only sanctioned way to write to them so call sites read as intent rather
//! than raw SQL scattered through the codebase.

use crate::error::MoneyResult;
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

/// Adjusts a user's trust tier and records why. `delta` may be negative
/// (a late cancellation, a lost dispute) or positive (a streak of clean
/// completions); the running tier itself lives on `users.trust_tier` and is
/// updated by the caller in the same transaction as this ledger row.
pub async fn record_trust_event(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    delta: i16,
    reason: &str,
    related_task_id: Option<Uuid>,
) -> MoneyResult<()> {
    sqlx::query(
        "INSERT INTO trust_ledger (user_id, delta, reason, related_task_id, created_at)
         VALUES ($1, $2, $3, $4, now())",
    )
    .bind(user_id)
    .bind(delta)
    .bind(reason)
    .bind(related_task_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn record_badge_award(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    badge_key: &str,
    related_task_id: Option<Uuid>,
) -> MoneyResult<bool> {
    let result = sqlx::query(
        "INSERT INTO badge_ledger (user_id, badge_key, related_task_id, awarded_at)
         VALUES ($1, $2, $3, now())
         ON CONFLICT (user_id, badge_key) DO NOTHING",
    )
    .bind(user_id)
    .bind(badge_key)
    .bind(related_task_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() == 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize, serde::Deserialize)]
#[sqlx(type_name = "admin_action_type", rename_all = "snake_case")]
pub enum AdminActionType {
    KillSwitchActivate,
    KillSwitchDeactivate,
    DisputeResolve,
    ManualRefund,
    ManualRelease,
}

/// Every privileged write an admin makes against money or dispute state
/// lands here, independent of whatever else the action also wrote (spec
/// §4.7/§4.9/§4.11). Kept on the connection pool, not tied to the caller's
/// transaction, so the audit trail survives even a rollback of the action it
/// describes — losing the action but keeping silent about an attempt would
/// be worse than a record of an attempt that didn't stick.
pub async fn record_admin_action(
    pool: &sqlx::PgPool,
    admin_id: Uuid,
    action: AdminActionType,
    target_task_id: Option<Uuid>,
    detail: Json,
) -> MoneyResult<()> {
    sqlx::query(
        "INSERT INTO admin_actions (admin_id, action, target_task_id, detail, created_at)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(admin_id)
    .bind(action)
    .bind(target_task_id)
    .bind(detail)
    .bind(Utc::now() as DateTime<Utc>)
    .execute(pool)
    .await?;
    Ok(())
}
