//! Background job wiring shared by the main server binary and the
//! standalone `worker` binary: Reconciler (hourly), the Pending Transaction
//! Reaper (per-minute), the Escrow Timeout Sweeper (hourly), and the Outbox
//! worker (every 5s, with an hourly cleanup pass). Grounded in the teacher's
//! use of `tokio_cron_scheduler` for its own sync jobs.

use crate::config::Config;
use crate::fee::FeeSchedule;
use crate::psp_bridge::{PspBridge, PspClient};
use crate::{ledger, outbox, reaper, reconciler};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

pub async fn spawn<C, F>(
    pool: sqlx::PgPool,
    config: Config,
    psp_bridge: Arc<PspBridge<C>>,
    fees: Arc<F>,
) -> anyhow::Result<JobScheduler>
where
    C: PspClient + 'static,
    F: FeeSchedule + 'static,
{
    let scheduler = JobScheduler::new().await?;

    {
        let pool = pool.clone();
        let psp_bridge = psp_bridge.clone();
        scheduler
            .add(Job::new_async("0 0 * * * *", move |_uuid, _lock| {
                let pool = pool.clone();
                let psp_bridge = psp_bridge.clone();
                Box::pin(async move {
                    if let Err(e) = reconciler::run(&pool, psp_bridge.as_ref()).await {
                        tracing::error!(error = %e, "reconciler run failed");
                    }
                })
            })?)
            .await?;
    }

    {
        let pool = pool.clone();
        let sweeper_cfg = config.sweeper;
        scheduler
            .add(Job::new_async("0 * * * * *", move |_uuid, _lock| {
                let pool = pool.clone();
                Box::pin(async move {
                    match reaper::sweep_pending_transactions(&pool, &sweeper_cfg).await {
                        Ok(report) => tracing::info!(?report, "pending tx sweep complete"),
                        Err(e) => tracing::error!(error = %e, "pending tx sweep failed"),
                    }
                })
            })?)
            .await?;
    }

    {
        let pool = pool.clone();
        let psp_bridge = psp_bridge.clone();
        let fees = fees.clone();
        let sweeper_cfg = config.sweeper;
        scheduler
            .add(Job::new_async("0 0 * * * *", move |_uuid, _lock| {
                let pool = pool.clone();
                let psp_bridge = psp_bridge.clone();
                let fees = fees.clone();
                Box::pin(async move {
                    match reaper::sweep_timed_out_escrows(
                        &pool,
                        &sweeper_cfg,
                        psp_bridge.as_ref(),
                        fees.as_ref(),
                    )
                    .await
                    {
                        Ok(report) => tracing::info!(?report, "escrow timeout sweep complete"),
                        Err(e) => tracing::error!(error = %e, "escrow timeout sweep failed"),
                    }
                })
            })?)
            .await?;
    }

    {
        let pool = pool.clone();
        scheduler
            .add(Job::new_async("*/5 * * * * *", move |_uuid, _lock| {
                let pool = pool.clone();
                Box::pin(async move {
                    let publisher = outbox::LoggingPublisher;
                    match outbox::run_once(&pool, &publisher, 100).await {
                        Ok(report) => {
                            if report.published > 0 || report.failed > 0 {
                                tracing::info!(?report, "outbox run complete");
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "outbox run failed"),
                    }
                })
            })?)
            .await?;
    }

    {
        let pool = pool.clone();
        scheduler
            .add(Job::new_async("0 0 * * * *", move |_uuid, _lock| {
                let pool = pool.clone();
                Box::pin(async move {
                    if let Err(e) = outbox::cleanup_published(&pool, 7 * 24 * 60 * 60).await {
                        tracing::error!(error = %e, "outbox cleanup failed");
                    }
                })
            })?)
            .await?;
    }

    {
        let pool = pool.clone();
        scheduler
            .add(Job::new_async("0 30 * * * *", move |_uuid, _lock| {
                let pool = pool.clone();
                Box::pin(async move {
                    match ledger::snapshot_all_accounts(&pool).await {
                        Ok(written) => tracing::info!(written, "ledger snapshot run complete"),
                        Err(e) => tracing::error!(error = %e, "ledger snapshot run failed"),
                    }
                })
            })?)
            .await?;
    }

    scheduler.start().await?;
    Ok(scheduler)
}
