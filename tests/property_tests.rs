//! Property-based tests for the ledger and XP invariants (spec §8): zero-sum
//! commits, balances derived purely from entries, exactly-once XP, and the
//! prepare/reverse round-trip laws. Each property opens its own database via
//! `common::setup_test_database`, the same isolation the other integration
//! tests use.

mod common;

use common::{seed_task, seed_user, setup_test_database, FakePspClient};
use gigmarket_ledger_core::ledger::{self, EntryInput, LedgerTxType};
use gigmarket_ledger_core::models::{Direction, MoneyEventType};
use gigmarket_ledger_core::money_state_machine::{self, ActorContext, HandleRequest};
use gigmarket_ledger_core::psp_bridge::PspBridge;
use gigmarket_ledger_core::xp_service;
use proptest::prelude::*;
use std::time::Duration;
use uuid::Uuid;

fn bridge() -> PspBridge<FakePspClient> {
    PspBridge::new(FakePspClient::new(), Duration::from_secs(5))
}

async fn escrow_account(pool: &sqlx::PgPool, task_id: Uuid) -> Uuid {
    sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM ledger_accounts WHERE owner_type = 'task' AND owner_id = $1 AND type = 'liability'",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// P1: any committed ledger transaction has equal debits and credits,
    /// no matter how many legs it's split across.
    #[test]
    fn prop_commit_is_always_zero_sum(
        amount_cents in 1i64..1_000_000,
        num_credit_legs in 1usize..4,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = setup_test_database().await.unwrap();
            let mut tx = pool.begin().await.unwrap();

            let debit_account = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO ledger_accounts (id, owner_type, owner_id, type, balance_cents)
                 VALUES ($1, 'platform', $2, 'asset', 0)",
            )
            .bind(debit_account)
            .bind(Uuid::new_v4())
            .execute(&mut *tx)
            .await
            .unwrap();

            // Split amount_cents across num_credit_legs credit entries so the
            // last leg absorbs the remainder; every leg stays > 0.
            let per_leg = amount_cents / num_credit_legs as i64;
            let mut credit_amounts: Vec<i64> = vec![per_leg; num_credit_legs];
            let remainder = amount_cents - per_leg * num_credit_legs as i64;
            credit_amounts[num_credit_legs - 1] += remainder;
            credit_amounts.retain(|c| *c > 0);
            if credit_amounts.is_empty() {
                credit_amounts.push(amount_cents);
            }
            // Re-balance: debit must equal the sum of whatever survived the filter.
            let total_credits: i64 = credit_amounts.iter().sum();

            let mut entries = vec![EntryInput {
                account_id: debit_account,
                direction: Direction::Debit,
                amount_cents: total_credits,
            }];
            for credit_cents in &credit_amounts {
                let credit_account = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO ledger_accounts (id, owner_type, owner_id, type, balance_cents)
                     VALUES ($1, 'user', $2, 'liability', 0)",
                )
                .bind(credit_account)
                .bind(Uuid::new_v4())
                .execute(&mut *tx)
                .await
                .unwrap();
                entries.push(EntryInput {
                    account_id: credit_account,
                    direction: Direction::Credit,
                    amount_cents: *credit_cents,
                });
            }

            let key = format!("prop-zero-sum-{}", Uuid::new_v4());
            let outcome = ledger::prepare(
                &mut tx,
                &key,
                LedgerTxType::Hold,
                "prop test",
                serde_json::json!({}),
                &entries,
            )
            .await
            .unwrap();
            ledger::commit(&mut tx, outcome.ulid).await.unwrap();

            let balanced = ledger::verify(&mut tx, outcome.ulid).await.unwrap();
            prop_assert!(balanced);
            tx.commit().await.unwrap();

            pool.close().await;
            Ok(())
        })?;
    }

    /// P2: after a commit, every touched account's `balance_cents` equals the
    /// signed sum of its own `ledger_entries`, not just some cached counter.
    #[test]
    fn prop_balance_equals_sum_of_entries(amount_cents in 1i64..500_000) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = setup_test_database().await.unwrap();
            let poster = seed_user(&pool).await.unwrap();
            let hustler = seed_user(&pool).await.unwrap();
            let task_id = seed_task(&pool, poster, Some(hustler), amount_cents, "accepted").await.unwrap();
            let b = bridge();

            money_state_machine::handle(&pool, HandleRequest {
                task_id,
                event: MoneyEventType::HoldEscrow,
                event_id: Uuid::new_v4(),
                external_event_id: None,
                actor: ActorContext::default(),
                psp_bridge: &b,
                fees: &gigmarket_ledger_core::fee::FlatFee { bps: 0 },
            }).await.unwrap();

            let escrow = escrow_account(&pool, task_id).await;
            let balance: i64 = sqlx::query_scalar("SELECT balance_cents FROM ledger_accounts WHERE id = $1")
                .bind(escrow)
                .fetch_one(&pool)
                .await
                .unwrap();

            let (debits, credits): (i64, i64) = sqlx::query_as(
                "SELECT COALESCE(SUM(amount_cents) FILTER (WHERE direction = 'debit'), 0),
                        COALESCE(SUM(amount_cents) FILTER (WHERE direction = 'credit'), 0)
                 FROM ledger_entries WHERE account_id = $1",
            )
            .bind(escrow)
            .fetch_one(&pool)
            .await
            .unwrap();
            // Escrow is a liability account: credit increases, debit decreases.
            prop_assert_eq!(balance, credits - debits);
            prop_assert_eq!(balance, amount_cents);

            pool.close().await;
            Ok(())
        })?;
    }

    /// P5: awarding XP for the same released task twice is a no-op the
    /// second time, regardless of the price.
    #[test]
    fn prop_xp_award_is_exactly_once(price_cents in 100i64..250_000) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = setup_test_database().await.unwrap();
            let poster = seed_user(&pool).await.unwrap();
            let hustler = seed_user(&pool).await.unwrap();
            let task_id = seed_task(&pool, poster, Some(hustler), price_cents, "accepted").await.unwrap();

            sqlx::query("UPDATE money_state_lock SET current_state = 'released' WHERE task_id = $1")
                .bind(task_id)
                .execute(&pool)
                .await
                .unwrap();

            let mut tx = pool.begin().await.unwrap();
            let first = xp_service::award_xp_for_task(&mut tx, task_id, hustler, price_cents, chrono::Utc::now())
                .await
                .unwrap();
            tx.commit().await.unwrap();
            prop_assert!(!first.already_awarded);

            let mut tx2 = pool.begin().await.unwrap();
            let second = xp_service::award_xp_for_task(&mut tx2, task_id, hustler, price_cents, chrono::Utc::now())
                .await
                .unwrap();
            tx2.commit().await.unwrap();
            prop_assert!(second.already_awarded);
            prop_assert_eq!(second.final_xp, first.final_xp);
            prop_assert_eq!(second.new_total_xp, first.new_total_xp);

            let row_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM xp_ledger WHERE money_state_lock_task_id = $1",
            )
            .bind(task_id)
            .fetch_one(&pool)
            .await
            .unwrap();
            prop_assert_eq!(row_count, 1);

            pool.close().await;
            Ok(())
        })?;
    }

    /// Round-trip law: `Prepare(k, p); Prepare(k, p)` (same key, same
    /// payload) returns the same ULID and leaves exactly one prepare row.
    #[test]
    fn prop_prepare_with_same_key_and_payload_is_idempotent(amount_cents in 1i64..100_000) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = setup_test_database().await.unwrap();
            let mut tx = pool.begin().await.unwrap();

            let a = Uuid::new_v4();
            let b = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO ledger_accounts (id, owner_type, owner_id, type, balance_cents)
                 VALUES ($1, 'platform', $2, 'asset', 0)",
            )
            .bind(a)
            .bind(Uuid::new_v4())
            .execute(&mut *tx)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO ledger_accounts (id, owner_type, owner_id, type, balance_cents)
                 VALUES ($1, 'user', $2, 'liability', 0)",
            )
            .bind(b)
            .bind(Uuid::new_v4())
            .execute(&mut *tx)
            .await
            .unwrap();

            let entries = [
                EntryInput { account_id: a, direction: Direction::Debit, amount_cents },
                EntryInput { account_id: b, direction: Direction::Credit, amount_cents },
            ];
            let key = format!("prop-prepare-{}", Uuid::new_v4());

            let first = ledger::prepare(&mut tx, &key, LedgerTxType::Hold, "p", serde_json::json!({}), &entries)
                .await
                .unwrap();
            prop_assert!(!first.reused);
            let second = ledger::prepare(&mut tx, &key, LedgerTxType::Hold, "p", serde_json::json!({}), &entries)
                .await
                .unwrap();
            prop_assert!(second.reused);
            prop_assert_eq!(first.ulid, second.ulid);

            let prepare_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_prepares WHERE idempotency_key = $1")
                .bind(&key)
                .fetch_one(&mut *tx)
                .await
                .unwrap();
            prop_assert_eq!(prepare_rows, 1);

            tx.rollback().await.ok();
            pool.close().await;
            Ok(())
        })?;
    }

    /// Round-trip law: `Reverse(Commit(T))` composed with `Commit(T)` leaves
    /// every touched account's balance back where it started.
    #[test]
    fn prop_reverse_undoes_commit(amount_cents in 1i64..100_000) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = setup_test_database().await.unwrap();
            let mut tx = pool.begin().await.unwrap();

            let a = Uuid::new_v4();
            let b = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO ledger_accounts (id, owner_type, owner_id, type, balance_cents)
                 VALUES ($1, 'platform', $2, 'asset', 0)",
            )
            .bind(a)
            .bind(Uuid::new_v4())
            .execute(&mut *tx)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO ledger_accounts (id, owner_type, owner_id, type, balance_cents)
                 VALUES ($1, 'user', $2, 'liability', 0)",
            )
            .bind(b)
            .bind(Uuid::new_v4())
            .execute(&mut *tx)
            .await
            .unwrap();

            let before_a: i64 = sqlx::query_scalar("SELECT balance_cents FROM ledger_accounts WHERE id = $1")
                .bind(a)
                .fetch_one(&mut *tx)
                .await
                .unwrap();
            let before_b: i64 = sqlx::query_scalar("SELECT balance_cents FROM ledger_accounts WHERE id = $1")
                .bind(b)
                .fetch_one(&mut *tx)
                .await
                .unwrap();

            let entries = [
                EntryInput { account_id: a, direction: Direction::Debit, amount_cents },
                EntryInput { account_id: b, direction: Direction::Credit, amount_cents },
            ];
            let key = format!("prop-reverse-{}", Uuid::new_v4());
            let outcome = ledger::prepare(&mut tx, &key, LedgerTxType::Hold, "p", serde_json::json!({}), &entries)
                .await
                .unwrap();
            ledger::commit(&mut tx, outcome.ulid).await.unwrap();
            ledger::reverse(&mut tx, outcome.ulid, "prop test reversal").await.unwrap();

            let after_a: i64 = sqlx::query_scalar("SELECT balance_cents FROM ledger_accounts WHERE id = $1")
                .bind(a)
                .fetch_one(&mut *tx)
                .await
                .unwrap();
            let after_b: i64 = sqlx::query_scalar("SELECT balance_cents FROM ledger_accounts WHERE id = $1")
                .bind(b)
                .fetch_one(&mut *tx)
                .await
                .unwrap();
            prop_assert_eq!(before_a, after_a);
            prop_assert_eq!(before_b, after_b);

            tx.commit().await.unwrap();
            pool.close().await;
            Ok(())
        })?;
    }

    /// P9: delivering the same inbound event twice (same `event_id`, same
    /// `external_event_id`) never produces a second ledger transaction or a
    /// second state advance, no matter the price.
    #[test]
    fn prop_duplicate_event_id_is_a_pure_replay(price_cents in 100i64..250_000) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = setup_test_database().await.unwrap();
            let poster = seed_user(&pool).await.unwrap();
            let hustler = seed_user(&pool).await.unwrap();
            let task_id = seed_task(&pool, poster, Some(hustler), price_cents, "accepted").await.unwrap();
            let b = bridge();
            let event_id = Uuid::new_v4();

            let first = money_state_machine::handle(&pool, HandleRequest {
                task_id,
                event: MoneyEventType::HoldEscrow,
                event_id,
                external_event_id: Some("evt_dup".into()),
                actor: ActorContext::default(),
                psp_bridge: &b,
                fees: &gigmarket_ledger_core::fee::FlatFee { bps: 0 },
            }).await.unwrap();

            let replay = money_state_machine::handle(&pool, HandleRequest {
                task_id,
                event: MoneyEventType::HoldEscrow,
                event_id,
                external_event_id: Some("evt_dup".into()),
                actor: ActorContext::default(),
                psp_bridge: &b,
                fees: &gigmarket_ledger_core::fee::FlatFee { bps: 0 },
            }).await;
            prop_assert!(replay.is_err());

            let tx_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM ledger_transactions WHERE id = $1",
            )
            .bind(first.ledger_tx_id.to_string())
            .fetch_one(&pool)
            .await
            .unwrap();
            prop_assert_eq!(tx_count, 1);

            let escrow = escrow_account(&pool, task_id).await;
            let entry_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM ledger_entries WHERE account_id = $1",
            )
            .bind(escrow)
            .fetch_one(&pool)
            .await
            .unwrap();
            prop_assert_eq!(entry_count, 1);

            pool.close().await;
            Ok(())
        })?;
    }
}
