//! Outbox (spec §4.12): durable, at-least-once delivery of domain events to
//! whatever consumes them outside the transactional core (notifications,
//! analytics, the product API's cache invalidation). An event is enqueued in
//! the same transaction as the state change it describes, so a committed
//! state change can never silently fail to produce its event and a rolled
//! back one never produces a phantom one.

use crate::error::MoneyResult;
use async_trait::async_trait;
use serde_json::Value as Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Json,
    pub attempts: i32,
}

/// Enqueues an event. Must be called with the same `tx` that commits the
/// state change the event describes.
pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    event_type: &str,
    payload: Json,
) -> MoneyResult<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO outbox (id, event_type, payload, attempts, created_at)
         VALUES ($1, $2, $3, 0, now())",
    )
    .bind(id)
    .bind(event_type)
    .bind(&payload)
    .execute(&mut **tx)
    .await?;
    Ok(id)
}

/// The downstream sink. A `Logging` implementation is provided for
/// environments with nothing else wired up yet; production deployments
/// supply their own (message bus, webhook fan-out, whatever the consuming
/// side expects).
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> anyhow::Result<()>;
}

pub struct LoggingPublisher;

#[async_trait]
impl OutboxPublisher for LoggingPublisher {
    async fn publish(&self, event: &OutboxEvent) -> anyhow::Result<()> {
        tracing::info!(event_id = %event.id, event_type = %event.event_type, "outbox: publish (logging sink)");
        Ok(())
    }
}

const MAX_ATTEMPTS: i32 = 10;

#[derive(Debug, Default)]
pub struct OutboxRunReport {
    pub published: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// Polls up to `batch_size` unpublished rows (oldest first) and attempts
/// delivery. A publish failure increments `attempts` and leaves the row for
/// the next poll; after `MAX_ATTEMPTS` the row is marked `dead_letter` so a
/// permanently-broken consumer can't wedge the queue behind it forever.
pub async fn run_once(
    pool: &PgPool,
    publisher: &dyn OutboxPublisher,
    batch_size: i64,
) -> MoneyResult<OutboxRunReport> {
    let rows = sqlx::query_as::<_, OutboxEvent>(
        "SELECT id, event_type, payload, attempts FROM outbox
         WHERE published_at IS NULL AND status != 'dead_letter'
         ORDER BY created_at ASC
         LIMIT $1",
    )
    .bind(batch_size)
    .fetch_all(pool)
    .await?;

    let mut report = OutboxRunReport::default();

    for event in rows {
        match publisher.publish(&event).await {
            Ok(()) => {
                sqlx::query("UPDATE outbox SET published_at = now() WHERE id = $1")
                    .bind(event.id)
                    .execute(pool)
                    .await?;
                report.published += 1;
            }
            Err(e) => {
                let attempts = event.attempts + 1;
                tracing::warn!(event_id = %event.id, attempts, error = %e, "outbox: publish failed");
                if attempts >= MAX_ATTEMPTS {
                    sqlx::query("UPDATE outbox SET attempts = $1, status = 'dead_letter' WHERE id = $2")
                        .bind(attempts)
                        .bind(event.id)
                        .execute(pool)
                        .await?;
                    report.dead_lettered += 1;
                } else {
                    sqlx::query("UPDATE outbox SET attempts = $1 WHERE id = $2")
                        .bind(attempts)
                        .bind(event.id)
                        .execute(pool)
                        .await?;
                    report.failed += 1;
                }
            }
        }
    }

    Ok(report)
}

/// Deletes published rows older than the retention window; run on a slower
/// cadence than `run_once` (spec §4.12, `outbox_cleanup_interval_secs`).
pub async fn cleanup_published(pool: &PgPool, older_than_secs: i64) -> MoneyResult<u64> {
    let result = sqlx::query(
        "DELETE FROM outbox WHERE published_at IS NOT NULL AND published_at < now() - ($1 || ' seconds')::interval",
    )
    .bind(older_than_secs.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
