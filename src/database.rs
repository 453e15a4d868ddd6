//! Database connection pool and migrations runner.

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    tracing::info!("connecting to postgres");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    tracing::info!("connected to postgres");
    Ok(pool)
}

/// Runs the embedded SQL migrations, idempotently, at boot. Production
/// bootstraps run this before anything else starts (spec §6) — the schema's
/// invariant triggers and append-only guards must exist before the first
/// `money_state_machine::handle` call.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("migrations applied");
    Ok(())
}
