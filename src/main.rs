use gigmarket_ledger_core::config::Config;
use gigmarket_ledger_core::fee::FlatFee;
use gigmarket_ledger_core::psp_bridge::{HttpPspClient, PspBridge};
use gigmarket_ledger_core::{database, jobs, webhooks};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

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

    let _scheduler = jobs::spawn(pool.clone(), config.clone(), psp_bridge.clone(), fees.clone()).await?;

    let webhook_state = Arc::new(webhooks::WebhookState {
        pool: pool.clone(),
        psp_bridge: psp_bridge.clone(),
        fees: Box::new(FlatFee {
            bps: config.fees.flat_fee_bps,
        }),
    });
    let app = webhooks::router(webhook_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!(%addr, "money engine listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
