//! Standalone background-jobs process: runs the Reconciler, the two Reaper
//! sweepers, and the Outbox worker without the HTTP/webhook surface, so the
//! jobs can be scaled and deployed independently of the request path.

use gigmarket_ledger_core::config::Config;
use gigmarket_ledger_core::fee::FlatFee;
use gigmarket_ledger_core::psp_bridge::{HttpPspClient, PspBridge};
use gigmarket_ledger_core::{database, jobs};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    config.print_config();

    if config.kill_switch_override {
        tracing::error!("KILL_SWITCH_OVERRIDE is set; all money-moving operations will be refused");
    }

    let pool = database::create_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let psp_bridge = Arc::new(PspBridge::new(
        HttpPspClient::new("https://psp.internal", config.psp_secret_key.clone()),
        Duration::from_secs(config.timeouts.psp_call_timeout_secs),
    ));
    let fees = Arc::new(FlatFee {
        bps: config.fees.flat_fee_bps,
    });

    let mut scheduler = jobs::spawn(pool, config, psp_bridge, fees).await?;

    tracing::info!("worker started, background jobs running");
    signal::ctrl_c().await?;
    tracing::info!("worker shutting down");
    scheduler.shutdown().await?;

    Ok(())
}
