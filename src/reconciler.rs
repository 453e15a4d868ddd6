//! Reconciler (spec §4.10): compares the "Platform Cash" ledger account's
//! balance against the PSP's reported balance. Any non-zero drift is itself
//! a critical invariant violation — there is no tolerance band — so finding
//! one trips the kill-switch rather than just logging a warning.

use crate::error::{MoneyError, MoneyResult};
use crate::kill_switch;
use crate::psp_bridge::PspBridge;
use crate::psp_bridge::PspClient;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct ReconciliationReport {
    pub internal_cents: i64,
    pub external_cents: i64,
    pub drift_cents: i64,
    pub within_tolerance: bool,
}

async fn internal_cash_balance(pool: &PgPool) -> MoneyResult<i64> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(balance_cents), 0) AS total
         FROM ledger_accounts WHERE type = 'asset' AND name = 'Platform Cash'",
    )
    .fetch_one(pool)
    .await?;
    Ok(row.get("total"))
}

/// Runs one reconciliation pass. On any non-zero drift, activates the
/// kill-switch and returns `Err(LedgerDrift)` — callers (the scheduled job)
/// should log this as a paging-severity event, not retry it away.
pub async fn run<C: PspClient>(
    pool: &PgPool,
    psp_bridge: &PspBridge<C>,
) -> MoneyResult<ReconciliationReport> {
    let internal_cents = internal_cash_balance(pool).await?;
    let balance = psp_bridge
        .retrieve_balance()
        .await
        .map_err(MoneyError::Other)?;
    let external_cents = balance.available_cents + balance.pending_cents;
    let drift_cents = internal_cents - external_cents;
    let within_tolerance = drift_cents == 0;

    let report = ReconciliationReport {
        internal_cents,
        external_cents,
        drift_cents,
        within_tolerance,
    };

    if !within_tolerance {
        tracing::error!(
            internal_cents,
            external_cents,
            drift_cents,
            "reconciler: ledger drift"
        );
        kill_switch::activate(
            pool,
            &format!("reconciler drift of {drift_cents} cents"),
            "reconciler",
        )
        .await?;
        return Err(MoneyError::LedgerDrift {
            internal: internal_cents,
            external: external_cents,
            drift: drift_cents,
        });
    }

    tracing::info!(internal_cents, external_cents, drift_cents, "reconciler: no drift");
    Ok(report)
}
