//! Integration tests for the money engine against a real Postgres database.
//!
//! These exercise the worked end-to-end scenarios: hold -> release -> XP,
//! concurrent accept/hold contention, dispute resolution, escrow timeout,
//! and reconciler drift detection. Mirrors the teacher's
//! `integration_tests.rs` structure: one throwaway database per test,
//! migrations applied, real async Postgres round-trips throughout.

mod common;

use common::{seed_task, seed_user, setup_test_database, FakePspClient};
use gigmarket_ledger_core::fee::FlatFee;
use gigmarket_ledger_core::models::{MoneyEventType, MoneyState, ProofStatus, TaskStatus};
use gigmarket_ledger_core::money_state_machine::{self, ActorContext, HandleRequest};
use gigmarket_ledger_core::psp_bridge::PspBridge;
use gigmarket_ledger_core::reaper;
use gigmarket_ledger_core::reconciler;
use gigmarket_ledger_core::{dispute_service, kill_switch};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn bridge() -> PspBridge<FakePspClient> {
    PspBridge::new(FakePspClient::new(), Duration::from_secs(5))
}

async fn user_row(pool: &sqlx::PgPool, id: Uuid) -> (i64, i16, i32) {
    let row = sqlx::query("SELECT xp, level, streak FROM users WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap();
    (row.get("xp"), row.get("level"), row.get("streak"))
}

/// Scenario 1: Hold -> Release -> XP (spec §8 scenario 1).
#[tokio::test]
async fn hold_then_release_awards_xp_exactly_once() -> anyhow::Result<()> {
    let pool = setup_test_database().await?;
    let psp_bridge = bridge();
    let fees = FlatFee { bps: 1200 };

    let poster = seed_user(&pool).await?;
    let hustler = seed_user(&pool).await?;
    let task_id = seed_task(&pool, poster, Some(hustler), 5000, "accepted").await?;

    let hold_outcome = money_state_machine::handle(
        &pool,
        HandleRequest {
            task_id,
            event: MoneyEventType::HoldEscrow,
            event_id: Uuid::new_v4(),
            external_event_id: None,
            actor: ActorContext::default(),
            psp_bridge: &psp_bridge,
            fees: &fees,
        },
    )
    .await?;
    assert_eq!(hold_outcome.new_money_state, MoneyState::Held);

    sqlx::query(
        "INSERT INTO proofs (task_id, status) VALUES ($1, 'accepted')",
    )
    .bind(task_id)
    .execute(&pool)
    .await?;

    let release_event_id = Uuid::new_v4();
    let release_outcome = money_state_machine::handle(
        &pool,
        HandleRequest {
            task_id,
            event: MoneyEventType::ReleasePayout,
            event_id: release_event_id,
            external_event_id: None,
            actor: ActorContext::default(),
            psp_bridge: &psp_bridge,
            fees: &fees,
        },
    )
    .await?;
    assert_eq!(release_outcome.new_money_state, MoneyState::Released);
    assert_eq!(release_outcome.xp_awarded, Some(50));

    let (xp, level, streak) = user_row(&pool, hustler).await;
    assert_eq!(xp, 50);
    assert_eq!(level, 1);
    assert_eq!(streak, 1);

    let xp_rows = sqlx::query("SELECT count(*) AS n FROM xp_ledger WHERE money_state_lock_task_id = $1")
        .bind(task_id)
        .fetch_one(&pool)
        .await?;
    let n: i64 = xp_rows.get("n");
    assert_eq!(n, 1);

    // Re-deliver the same release event: replay, no new rows, no new XP.
    let replay = money_state_machine::handle(
        &pool,
        HandleRequest {
            task_id,
            event: MoneyEventType::ReleasePayout,
            event_id: release_event_id,
            external_event_id: None,
            actor: ActorContext::default(),
            psp_bridge: &psp_bridge,
            fees: &fees,
        },
    )
    .await;
    assert!(matches!(replay, Err(gigmarket_ledger_core::error::MoneyError::IdempotentReplay { .. })));

    let (xp_after, _, _) = user_row(&pool, hustler).await;
    assert_eq!(xp_after, 50);

    let task_status: TaskStatus = sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1")
        .bind(task_id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(task_status, TaskStatus::Completed);

    Ok(())
}

/// Scenario 2: retry storm — concurrent HOLD_ESCROW attempts on one task;
/// exactly one succeeds (spec §8 P10).
#[tokio::test]
async fn concurrent_hold_escrow_only_one_succeeds() -> anyhow::Result<()> {
    let pool = setup_test_database().await?;
    let psp_bridge = Arc::new(bridge());
    let fees = Arc::new(FlatFee { bps: 1200 });

    let poster = seed_user(&pool).await?;
    let hustler = seed_user(&pool).await?;
    let task_id = seed_task(&pool, poster, Some(hustler), 5000, "accepted").await?;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let pool = pool.clone();
        let psp_bridge = psp_bridge.clone();
        let fees = fees.clone();
        handles.push(tokio::spawn(async move {
            money_state_machine::handle(
                &pool,
                HandleRequest {
                    task_id,
                    event: MoneyEventType::HoldEscrow,
                    event_id: Uuid::new_v4(),
                    external_event_id: None,
                    actor: ActorContext::default(),
                    psp_bridge: psp_bridge.as_ref(),
                    fees: fees.as_ref(),
                },
            )
            .await
        }));
    }

    let mut successes = 0;
    for h in handles {
        if h.await?.is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);

    let state: MoneyState =
        sqlx::query_scalar("SELECT current_state FROM money_state_lock WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(state, MoneyState::Held);

    Ok(())
}

/// Scenario 4: dispute then refund — no XP row, final state terminal.
#[tokio::test]
async fn dispute_then_refund_has_no_xp_row() -> anyhow::Result<()> {
    let pool = setup_test_database().await?;
    let psp_bridge = bridge();
    let fees = FlatFee { bps: 1200 };

    let poster = seed_user(&pool).await?;
    let hustler = seed_user(&pool).await?;
    let task_id = seed_task(&pool, poster, Some(hustler), 2000, "accepted").await?;

    money_state_machine::handle(
        &pool,
        HandleRequest {
            task_id,
            event: MoneyEventType::HoldEscrow,
            event_id: Uuid::new_v4(),
            external_event_id: None,
            actor: ActorContext::default(),
            psp_bridge: &psp_bridge,
            fees: &fees,
        },
    )
    .await?;

    sqlx::query("INSERT INTO proofs (task_id, status) VALUES ($1, 'submitted')")
        .bind(task_id)
        .execute(&pool)
        .await?;
    sqlx::query("UPDATE tasks SET status = 'proof_submitted' WHERE id = $1")
        .bind(task_id)
        .execute(&pool)
        .await?;

    let dispute = dispute_service::open_dispute(
        &pool,
        task_id,
        poster,
        "work not delivered".to_string(),
        &psp_bridge,
        &fees,
    )
    .await?;

    let resolved = dispute_service::resolve_dispute(
        &pool,
        dispute.id,
        Uuid::new_v4(),
        dispute_service::Resolution::RefundPoster,
        &psp_bridge,
        &fees,
    )
    .await?;
    assert_eq!(resolved.new_money_state, MoneyState::Refunded);

    let xp_rows = sqlx::query("SELECT count(*) AS n FROM xp_ledger WHERE money_state_lock_task_id = $1")
        .bind(task_id)
        .fetch_one(&pool)
        .await?;
    let n: i64 = xp_rows.get("n");
    assert_eq!(n, 0);

    let task_status: TaskStatus = sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1")
        .bind(task_id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(task_status, TaskStatus::Completed);

    Ok(())
}

/// Scenario 5: escrow held past the timeout with no proof ever submitted is
/// auto-refunded by the sweeper.
#[tokio::test]
async fn escrow_timeout_sweeper_auto_refunds_abandoned_task() -> anyhow::Result<()> {
    let pool = setup_test_database().await?;
    let psp_bridge = bridge();
    let fees = FlatFee { bps: 1200 };

    let poster = seed_user(&pool).await?;
    let hustler = seed_user(&pool).await?;
    let task_id = seed_task(&pool, poster, Some(hustler), 3000, "accepted").await?;

    money_state_machine::handle(
        &pool,
        HandleRequest {
            task_id,
            event: MoneyEventType::HoldEscrow,
            event_id: Uuid::new_v4(),
            external_event_id: None,
            actor: ActorContext::default(),
            psp_bridge: &psp_bridge,
            fees: &fees,
        },
    )
    .await?;

    sqlx::query("UPDATE tasks SET accepted_at = now() - interval '49 hours' WHERE id = $1")
        .bind(task_id)
        .execute(&pool)
        .await?;

    let cfg = gigmarket_ledger_core::config::SweeperConfig::default();
    let report = reaper::sweep_timed_out_escrows(&pool, &cfg, &psp_bridge, &fees).await?;
    assert_eq!(report.auto_refunded, 1);

    let state: MoneyState =
        sqlx::query_scalar("SELECT current_state FROM money_state_lock WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(state, MoneyState::Refunded);

    let xp_rows = sqlx::query("SELECT count(*) AS n FROM xp_ledger WHERE money_state_lock_task_id = $1")
        .bind(task_id)
        .fetch_one(&pool)
        .await?;
    let n: i64 = xp_rows.get("n");
    assert_eq!(n, 0);

    Ok(())
}

/// Scenario 6: internal/external drift flips the kill-switch and subsequent
/// money-moving operations are refused until it is deactivated.
#[tokio::test]
async fn ledger_drift_flips_kill_switch_and_blocks_subsequent_holds() -> anyhow::Result<()> {
    let pool = setup_test_database().await?;
    let psp_bridge = bridge();
    let fees = FlatFee { bps: 1200 };

    let poster = seed_user(&pool).await?;
    sqlx::query(
        "UPDATE ledger_accounts SET balance_cents = 100000
         WHERE owner_type = 'platform' AND type = 'asset' AND name = 'Platform Cash'",
    )
    .execute(&pool)
    .await?;

    let report = reconciler::run(&pool, &psp_bridge).await;
    assert!(report.is_err());

    let state = kill_switch::current_state(&pool).await?;
    assert!(state.active);

    let hustler = seed_user(&pool).await?;
    let task_id = seed_task(&pool, poster, Some(hustler), 1000, "accepted").await?;
    let blocked = money_state_machine::handle(
        &pool,
        HandleRequest {
            task_id,
            event: MoneyEventType::HoldEscrow,
            event_id: Uuid::new_v4(),
            external_event_id: None,
            actor: ActorContext::default(),
            psp_bridge: &psp_bridge,
            fees: &fees,
        },
    )
    .await;
    assert!(matches!(
        blocked,
        Err(gigmarket_ledger_core::error::MoneyError::BlockedByKillSwitch { .. })
    ));

    kill_switch::deactivate(&pool, "test-admin").await?;
    let unblocked = money_state_machine::handle(
        &pool,
        HandleRequest {
            task_id,
            event: MoneyEventType::HoldEscrow,
            event_id: Uuid::new_v4(),
            external_event_id: None,
            actor: ActorContext::default(),
            psp_bridge: &psp_bridge,
            fees: &fees,
        },
    )
    .await?;
    assert_eq!(unblocked.new_money_state, MoneyState::Held);

    Ok(())
}

/// P4: a terminal money_state_lock rejects further mutation at the DB level.
#[tokio::test]
async fn terminal_money_state_lock_rejects_update() -> anyhow::Result<()> {
    let pool = setup_test_database().await?;
    let psp_bridge = bridge();
    let fees = FlatFee { bps: 1200 };

    let poster = seed_user(&pool).await?;
    let hustler = seed_user(&pool).await?;
    let task_id = seed_task(&pool, poster, Some(hustler), 2500, "accepted").await?;

    money_state_machine::handle(
        &pool,
        HandleRequest {
            task_id,
            event: MoneyEventType::HoldEscrow,
            event_id: Uuid::new_v4(),
            external_event_id: None,
            actor: ActorContext::default(),
            psp_bridge: &psp_bridge,
            fees: &fees,
        },
    )
    .await?;
    sqlx::query("INSERT INTO proofs (task_id, status) VALUES ($1, 'accepted')")
        .bind(task_id)
        .execute(&pool)
        .await?;
    money_state_machine::handle(
        &pool,
        HandleRequest {
            task_id,
            event: MoneyEventType::ReleasePayout,
            event_id: Uuid::new_v4(),
            external_event_id: None,
            actor: ActorContext::default(),
            psp_bridge: &psp_bridge,
            fees: &fees,
        },
    )
    .await?;

    let result = sqlx::query("UPDATE money_state_lock SET current_state = 'held' WHERE task_id = $1")
        .bind(task_id)
        .execute(&pool)
        .await;
    assert!(result.is_err());

    Ok(())
}

/// P3: append-only ledger_entries rejects UPDATE and DELETE.
#[tokio::test]
async fn ledger_entries_are_append_only() -> anyhow::Result<()> {
    let pool = setup_test_database().await?;
    let psp_bridge = bridge();
    let fees = FlatFee { bps: 1200 };

    let poster = seed_user(&pool).await?;
    let hustler = seed_user(&pool).await?;
    let task_id = seed_task(&pool, poster, Some(hustler), 1500, "accepted").await?;

    money_state_machine::handle(
        &pool,
        HandleRequest {
            task_id,
            event: MoneyEventType::HoldEscrow,
            event_id: Uuid::new_v4(),
            external_event_id: None,
            actor: ActorContext::default(),
            psp_bridge: &psp_bridge,
            fees: &fees,
        },
    )
    .await?;

    let update_result = sqlx::query("UPDATE ledger_entries SET amount_cents = 1 WHERE true")
        .execute(&pool)
        .await;
    assert!(update_result.is_err());

    let delete_result = sqlx::query("DELETE FROM ledger_entries").execute(&pool).await;
    assert!(delete_result.is_err());

    Ok(())
}

/// Not-before-accepted-proof: a task with only a submitted (not accepted)
/// proof cannot reach RELEASE_PAYOUT (spec P7).
#[tokio::test]
async fn release_payout_refused_while_proof_in_flight() -> anyhow::Result<()> {
    let pool = setup_test_database().await?;
    let psp_bridge = bridge();
    let fees = FlatFee { bps: 1200 };

    let poster = seed_user(&pool).await?;
    let hustler = seed_user(&pool).await?;
    let task_id = seed_task(&pool, poster, Some(hustler), 4000, "accepted").await?;

    money_state_machine::handle(
        &pool,
        HandleRequest {
            task_id,
            event: MoneyEventType::HoldEscrow,
            event_id: Uuid::new_v4(),
            external_event_id: None,
            actor: ActorContext::default(),
            psp_bridge: &psp_bridge,
            fees: &fees,
        },
    )
    .await?;

    sqlx::query("INSERT INTO proofs (task_id, status) VALUES ($1, 'analyzing')")
        .bind(task_id)
        .execute(&pool)
        .await?;

    let result = money_state_machine::handle(
        &pool,
        HandleRequest {
            task_id,
            event: MoneyEventType::ReleasePayout,
            event_id: Uuid::new_v4(),
            external_event_id: None,
            actor: ActorContext::default(),
            psp_bridge: &psp_bridge,
            fees: &fees,
        },
    )
    .await;
    assert!(matches!(
        result,
        Err(gigmarket_ledger_core::error::MoneyError::InvariantViolation(_))
    ));

    let xp_rows = sqlx::query("SELECT count(*) AS n FROM xp_ledger WHERE money_state_lock_task_id = $1")
        .bind(task_id)
        .fetch_one(&pool)
        .await?;
    let n: i64 = xp_rows.get("n");
    assert_eq!(n, 0);
    assert_eq!(ProofStatus::Analyzing.blocks_release(), true);

    Ok(())
}

/// Pending-transaction reaper: a stale pending ledger_transaction with no
/// PSP mirror is marked failed rather than silently resumed.
#[tokio::test]
async fn pending_tx_sweeper_fails_unmirrored_stale_transactions() -> anyhow::Result<()> {
    let pool = setup_test_database().await?;
    let poster = seed_user(&pool).await?;
    let hustler = seed_user(&pool).await?;
    let task_id = seed_task(&pool, poster, Some(hustler), 1000, "accepted").await?;

    let ulid = ulid::Ulid::new();
    sqlx::query(
        "INSERT INTO ledger_transactions (id, type, idempotency_key, status, metadata, description, created_at)
         VALUES ($1, 'hold', $2, 'pending', '{}', 'stale hold', now() - interval '10 minutes')",
    )
    .bind(ulid.to_string())
    .bind(format!("{task_id}:HOLD_ESCROW"))
    .execute(&pool)
    .await?;

    let cfg = gigmarket_ledger_core::config::SweeperConfig::default();
    let report = reaper::sweep_pending_transactions(&pool, &cfg).await?;
    assert_eq!(report.marked_failed, 1);

    let status: String = sqlx::query_scalar("SELECT status::text FROM ledger_transactions WHERE id = $1")
        .bind(ulid.to_string())
        .fetch_one(&pool)
        .await?;
    assert_eq!(status, "failed");

    Ok(())
}

