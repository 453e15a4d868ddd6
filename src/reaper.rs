//! Reaper (spec §4.10): two independent sweepers.
//!
//! `sweep_pending_transactions` resolves the split-brain window the PSP
//! Bridge's mirror log exists for — a process that died between a
//! successful PSP call and the local ledger commit leaves a `pending`
//! `ledger_transactions` row behind; the mirror tells us whether the PSP
//! side actually happened.
//!
//! `sweep_timed_out_escrows` auto-refunds tasks that have sat in `held`
//! past the configured timeout with no hustler completion, so an abandoned
//! task doesn't lock a poster's money indefinitely.

use crate::config::SweeperConfig;
use crate::error::MoneyResult;
use crate::fee::FeeSchedule;
use crate::ledger;
use crate::models::MoneyEventType;
use crate::money_state_machine::{self, ActorContext, HandleRequest};
use crate::psp_bridge::PspClient;
use chrono::{Duration, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct PendingSweepReport {
    pub inspected: usize,
    pub recovered_committed: usize,
    pub marked_failed: usize,
}

/// Finds `ledger_transactions` stuck in `pending` longer than
/// `stale_after_secs`, and for each one checks `psp_outbound_log` for the
/// matching idempotency key: a mirror hit means the PSP call succeeded and
/// the transaction should be committed now; no mirror means the call never
/// went out (or definitely failed) and the transaction should be marked
/// `failed` so its ledger_prepares row stops blocking a retry under a fresh
/// idempotency key.
pub async fn sweep_pending_transactions(
    pool: &PgPool,
    cfg: &SweeperConfig,
) -> MoneyResult<PendingSweepReport> {
    let cutoff = Utc::now() - Duration::seconds(cfg.pending_tx_stale_after_secs);
    let rows = sqlx::query(
        "SELECT id, idempotency_key FROM ledger_transactions
         WHERE status = 'pending' AND created_at < $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let mut report = PendingSweepReport {
        inspected: rows.len(),
        ..Default::default()
    };

    for row in rows {
        let ulid_str: String = row.get("id");
        let idempotency_key: String = row.get("idempotency_key");

        let mirrored: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM psp_outbound_log WHERE idempotency_key = $1",
        )
        .bind(&idempotency_key)
        .fetch_optional(pool)
        .await?;

        let mut tx = pool.begin().await?;
        let Ok(ulid) = ulid_str.parse() else {
            tx.rollback().await.ok();
            continue;
        };
        if mirrored.is_some() {
            tracing::warn!(idempotency_key, "reaper: recovering stuck pending tx from PSP mirror");
            ledger::commit(&mut tx, ulid).await?;
            report.recovered_committed += 1;
        } else {
            tracing::warn!(idempotency_key, "reaper: no PSP mirror, marking tx failed");
            sqlx::query("UPDATE ledger_transactions SET status = 'failed' WHERE id = $1")
                .bind(&ulid_str)
                .execute(&mut *tx)
                .await?;
            report.marked_failed += 1;
        }
        tx.commit().await?;
    }

    Ok(report)
}

#[derive(Debug, Default)]
pub struct EscrowTimeoutReport {
    pub inspected: usize,
    pub auto_refunded: usize,
    pub failed: usize,
}

/// Auto-refunds tasks whose escrow has been `held` for longer than
/// `escrow_held_timeout_hours` with no proof ever submitted — an abandoned
/// task, not a disputed one. A task with proof in flight is left alone; the
/// dispute path or manual admin action is the right tool there, not a timer.
pub async fn sweep_timed_out_escrows<C: PspClient>(
    pool: &PgPool,
    cfg: &SweeperConfig,
    psp_bridge: &crate::psp_bridge::PspBridge<C>,
    fees: &dyn FeeSchedule,
) -> MoneyResult<EscrowTimeoutReport> {
    let cutoff = Utc::now() - Duration::hours(cfg.escrow_held_timeout_hours);
    let rows = sqlx::query(
        "SELECT t.id FROM tasks t
         JOIN money_state_lock m ON m.task_id = t.id
         WHERE m.current_state = 'held'
           AND t.status = 'accepted'
           AND t.accepted_at < $1
           AND NOT EXISTS (SELECT 1 FROM proofs p WHERE p.task_id = t.id)",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let mut report = EscrowTimeoutReport {
        inspected: rows.len(),
        ..Default::default()
    };

    for row in rows {
        let task_id: Uuid = row.get("id");
        tracing::warn!(%task_id, "reaper: escrow timed out with no proof, auto-refunding");
        let result = money_state_machine::handle(
            pool,
            HandleRequest {
                task_id,
                event: MoneyEventType::RefundEscrow,
                event_id: Uuid::new_v4(),
                external_event_id: None,
                actor: ActorContext::default(),
                psp_bridge,
                fees,
            },
        )
        .await;
        match result {
            Ok(_) => report.auto_refunded += 1,
            Err(e) => {
                tracing::error!(%task_id, error = %e, "reaper: auto-refund failed");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}
