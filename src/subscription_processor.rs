//! Subscription/entitlement event processing — intentionally thin. Spec §9's
//! open question asks whether subscription events should share the money
//! engine's dedup table; the decision recorded in `DESIGN.md` is no: they
//! get their own `processed_subscription_events` table via
//! `replay_guard::subscription_event_already_processed`, so a bug in
//! entitlement handling can never corrupt money-event dedup or vice versa.
//!
//! Subscriptions (boost pricing, premium tiers) are themselves out of scope
//! (spec Non-goals) — this module only guarantees that if/when that feature
//! lands, its webhook events won't collide with the money engine's replay
//! guard.

use crate::error::MoneyResult;
use crate::replay_guard;
use sqlx::PgPool;

#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    pub psp_event_id: String,
    pub kind: String,
}

/// Records `psp_event_id` as processed and returns whether this call is the
/// one that actually did the work (`true`) versus a replay (`false`). Callers
/// add their own entitlement side effects where indicated; none exist yet.
pub async fn process(pool: &PgPool, event: SubscriptionEvent) -> MoneyResult<bool> {
    let mut tx = pool.begin().await?;
    if replay_guard::subscription_event_already_processed(&mut tx, &event.psp_event_id).await? {
        tx.rollback().await.ok();
        tracing::debug!(psp_event_id = %event.psp_event_id, "subscription processor: replay, no-op");
        return Ok(false);
    }

    // No entitlement side effects implemented: subscriptions are out of
    // scope. This exists so the dedup table has a writer and the table
    // itself is exercised.
    sqlx::query(
        "INSERT INTO processed_subscription_events (psp_event_id, kind, processed_at)
         VALUES ($1, $2, now())",
    )
    .bind(&event.psp_event_id)
    .bind(&event.kind)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}
