//! Replay Guard & Idempotency (spec §4.8): event-ID and external-ID dedup at
//! ingress, plus the HTTP-level idempotency-key cache for user-initiated
//! writes.

use crate::error::MoneyResult;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde_json::Value as Json;
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

/// Checks `money_events_processed` for `event_id`, and `processed_psp_events`
/// for `external_event_id` when present. A hit means: return success as an
/// idempotent replay, with zero side effects.
pub async fn already_processed(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    external_event_id: Option<&str>,
) -> MoneyResult<bool> {
    let internal_hit: Option<Uuid> =
        sqlx::query_scalar("SELECT event_id FROM money_events_processed WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&mut **tx)
            .await?;
    if internal_hit.is_some() {
        tracing::debug!(%event_id, "replay guard: internal event_id hit");
        return Ok(true);
    }

    if let Some(external_id) = external_event_id {
        let external_hit: Option<String> = sqlx::query_scalar(
            "SELECT psp_event_id FROM processed_psp_events WHERE psp_event_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&mut **tx)
        .await?;
        if external_hit.is_some() {
            tracing::debug!(external_id, "replay guard: external event_id hit");
            return Ok(true);
        }
    }

    Ok(false)
}

/// Records that `event_id` (and `external_event_id` if present) has now been
/// processed. Must be called inside the same transaction as the state
/// mutation it guards (spec §4.4 step 10).
pub async fn record_processed(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    external_event_id: Option<&str>,
) -> MoneyResult<()> {
    sqlx::query("INSERT INTO money_events_processed (event_id, processed_at) VALUES ($1, now())")
        .bind(event_id)
        .execute(&mut **tx)
        .await?;
    if let Some(external_id) = external_event_id {
        sqlx::query(
            "INSERT INTO processed_psp_events (psp_event_id, processed_at) VALUES ($1, now())
             ON CONFLICT (psp_event_id) DO NOTHING",
        )
        .bind(external_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Two separate dedup tables for money vs. subscription/entitlement events,
/// resolving the spec §9 open question in favor of the "safer choice" it
/// names. Subscription events never touch this guard's money tables.
pub async fn subscription_event_already_processed(
    tx: &mut Transaction<'_, Postgres>,
    psp_event_id: &str,
) -> MoneyResult<bool> {
    let hit: Option<String> = sqlx::query_scalar(
        "SELECT psp_event_id FROM processed_subscription_events WHERE psp_event_id = $1",
    )
    .bind(psp_event_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(hit.is_some())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyKeyStatus {
    Processing,
    Completed,
}

#[derive(Debug, Clone)]
struct CachedResponse {
    status: IdempotencyKeyStatus,
    body: Option<Json>,
    created_at: DateTime<Utc>,
}

/// HTTP-level idempotency-key cache (spec §4.8): a key already `Completed`
/// replays the cached response; a key `Processing` is a 409 to the caller.
/// Entries expire after 24h via moka's time-to-live.
pub struct IdempotencyKeyCache {
    cache: Cache<String, CachedResponse>,
}

impl IdempotencyKeyCache {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .time_to_live(Duration::from_secs(24 * 60 * 60))
                .max_capacity(100_000)
                .build(),
        }
    }

    pub async fn begin(&self, key: &str) -> Option<IdempotencyKeyStatus> {
        if let Some(existing) = self.cache.get(key).await {
            return Some(existing.status);
        }
        self.cache
            .insert(
                key.to_string(),
                CachedResponse {
                    status: IdempotencyKeyStatus::Processing,
                    body: None,
                    created_at: Utc::now(),
                },
            )
            .await;
        None
    }

    pub async fn complete(&self, key: &str, body: Json) {
        self.cache
            .insert(
                key.to_string(),
                CachedResponse {
                    status: IdempotencyKeyStatus::Completed,
                    body: Some(body),
                    created_at: Utc::now(),
                },
            )
            .await;
    }

    pub async fn cached_body(&self, key: &str) -> Option<Json> {
        self.cache.get(key).await.and_then(|r| r.body)
    }
}

impl Default for IdempotencyKeyCache {
    fn default() -> Self {
        Self::new()
    }
}
