//! MoneyStateMachine (spec §4.4): the orchestrator. `handle()` is the only
//! entry point allowed to move `money_state_lock` — every other module
//! (task/proof state machines, ledger, PSP bridge, XP service) is a
//! dependency it consults, never a peer it lets touch the lock directly.
//!
//! The whole operation is one SERIALIZABLE transaction guarded by
//! `SELECT ... FOR UPDATE` on the task's `money_state_lock` row, retried on a
//! PostgreSQL serialization failure by re-reading state from scratch (never
//! a blind resend) — the same shape as the teacher's `with_serializable_tx!`
//! macro, generalized here into a typed retry helper since `MoneyError`
//! already classifies `Conflict` for us.

use crate::error::{MoneyError, MoneyResult};
use crate::fee::{FeeContext, FeeSchedule};
use crate::kill_switch;
use crate::ledger::{self, EntryInput, LedgerTxType};
use crate::models::{
    AccountOwnerType, AccountType, Direction, MoneyEventType, MoneyState, MoneyStateLock,
    ProofStatus, Task, TaskStatus,
};
use crate::proof_state_machine;
use crate::psp_bridge::{CaptureRequest, PspBridge, PspClient, RefundRequest, TransferRequest};
use crate::replay_guard;
use crate::task_state_machine::{self, TaskEvent, TransitionContext};
use crate::xp_service;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration as StdDuration;
use uuid::Uuid;

const MAX_RETRY_ATTEMPTS: u32 = 5;
const BASE_RETRY_DELAY_MS: u64 = 10;

/// Caller-supplied facts the orchestrator cannot derive from the DB alone:
/// who is acting, and (for dispute resolution) the split terms.
#[derive(Debug, Clone, Default)]
pub struct ActorContext {
    pub admin_id: Option<Uuid>,
    pub dispute_reason: Option<String>,
    /// For DISPUTE_RESOLVE_SPLIT: hustler's cut, in cents. Must be in
    /// `[0, task.price_cents]`; the remainder refunds the poster.
    pub split_hustler_cents: Option<i64>,
}

pub struct HandleRequest<'a, C: PspClient> {
    pub task_id: Uuid,
    pub event: MoneyEventType,
    pub event_id: Uuid,
    pub external_event_id: Option<String>,
    pub actor: ActorContext,
    pub psp_bridge: &'a PspBridge<C>,
    pub fees: &'a dyn FeeSchedule,
}

#[derive(Debug, Clone)]
pub struct HandleOutcome {
    pub new_money_state: MoneyState,
    pub ledger_tx_id: ulid::Ulid,
    pub xp_awarded: Option<i64>,
    pub idempotent_replay: bool,
}

/// Entry point. Runs the full spec §4.4 algorithm inside one retried
/// SERIALIZABLE transaction.
pub async fn handle<C: PspClient>(
    pool: &PgPool,
    req: HandleRequest<'_, C>,
) -> MoneyResult<HandleOutcome> {
    // Step 1: ingress replay check, outside any transaction — a cheap early
    // exit for the overwhelmingly common "PSP retried the webhook" case.
    {
        let mut probe = pool.begin().await?;
        let seen =
            replay_guard::already_processed(&mut probe, req.event_id, req.external_event_id.as_deref())
                .await?;
        probe.rollback().await.ok();
        if seen {
            tracing::info!(event_id = %req.event_id, "money engine: idempotent replay, no-op");
            return Err(MoneyError::IdempotentReplay {
                event_id: req.event_id,
            });
        }
    }

    // Step 2: kill-switch, cheap early exit before any lock is taken.
    // Checked again in `handle_once` after the row lock is acquired — see
    // the comment there for why both checks are needed.
    kill_switch::assert_not_blocked(pool).await?;

    let mut attempt = 1u32;
    loop {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let result = handle_once(pool, &mut tx, &req).await;

        match result {
            Ok(outcome) => {
                tx.commit().await?;
                return Ok(outcome);
            }
            Err(e) => {
                tx.rollback().await.ok();
                if is_retryable(&e) && attempt < MAX_RETRY_ATTEMPTS {
                    let jitter = rand::thread_rng().gen_range(0..10);
                    let delay_ms = BASE_RETRY_DELAY_MS * (1 << (attempt - 1)) + jitter;
                    tokio::time::sleep(StdDuration::from_millis(delay_ms)).await;
                    attempt += 1;
                    continue;
                }
                return Err(e);
            }
        }
    }
}

fn is_retryable(err: &MoneyError) -> bool {
    matches!(err, MoneyError::Conflict)
        || matches!(err, MoneyError::Db(e) if crate::error::is_serialization_failure(e))
}

/// One attempt at the algorithm, inside an already-open SERIALIZABLE
/// transaction. Any error aborts the transaction; the caller decides whether
/// to retry.
async fn handle_once<C: PspClient>(
    pool: &PgPool,
    tx: &mut Transaction<'_, Postgres>,
    req: &HandleRequest<'_, C>,
) -> MoneyResult<HandleOutcome> {
    // Step 3: row lock. Every other reader/writer of this task's money state
    // serializes behind this SELECT ... FOR UPDATE.
    let lock_row = sqlx::query_as::<_, MoneyStateLock>(
        "SELECT task_id, current_state, next_allowed_events, version,
                psp_payment_intent_id, psp_charge_id, recovery_attempts
         FROM money_state_lock WHERE task_id = $1 FOR UPDATE",
    )
    .bind(req.task_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| MoneyError::NotFound(format!("money_state_lock for {}", req.task_id)))?;

    // Kill-switch, re-checked now that the row lock is held (spec §4.4 step 2,
    // §5): a flip that races with this call must let it finish, but nothing
    // that hasn't yet acquired the lock may proceed past this point.
    kill_switch::assert_not_blocked(pool).await?;

    // Step 4: replay check repeated under the lock, closing the window
    // between the step-1 probe and acquiring the row.
    if replay_guard::already_processed(tx, req.event_id, req.external_event_id.as_deref()).await? {
        return Err(MoneyError::IdempotentReplay {
            event_id: req.event_id,
        });
    }

    // Step 5: is this event legal from the current money state?
    if !lock_row.allows(req.event) {
        return Err(MoneyError::InvalidTransition {
            from: format!("{:?}", lock_row.current_state),
            event: req.event.as_str().to_string(),
            reason: "event not in next_allowed_events for current money state".into(),
        });
    }

    let task = sqlx::query_as::<_, Task>(
        "SELECT id, poster_id, hustler_id, price_cents, status, category,
                created_at, accepted_at, completed_at
         FROM tasks WHERE id = $1 FOR UPDATE",
    )
    .bind(req.task_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| MoneyError::NotFound(format!("task {}", req.task_id)))?;

    let now = Utc::now();

    // Step 6: consult the task/proof state machines for the side of the
    // system the money event mirrors. RELEASE_PAYOUT in particular must
    // respect the proof freeze rule (spec §4.5).
    let target_task_status = validate_paired_task_transition(tx, &task, req, now).await?;

    // Step 7-9: stage and commit the ledger entries, calling the PSP bridge
    // in between so a crash after the PSP call but before the local commit
    // is recoverable from the mirror log (spec §4.3/§9).
    let idempotency_key = format!("{}:{}", req.task_id, req.event.as_str());
    let (ledger_ulid, psp_ids) =
        apply_money_event(pool, tx, &task, req, &idempotency_key).await?;

    let new_state = crate::models::target_state_for(req.event);
    let new_next_allowed = crate::models::next_allowed_events_for(new_state);

    let updated = sqlx::query(
        "UPDATE money_state_lock
         SET current_state = $1, next_allowed_events = $2, version = version + 1,
             psp_payment_intent_id = COALESCE($3, psp_payment_intent_id),
             psp_charge_id = COALESCE($4, psp_charge_id)
         WHERE task_id = $5 AND version = $6",
    )
    .bind(new_state)
    .bind(&new_next_allowed)
    .bind(psp_ids.0.as_deref())
    .bind(psp_ids.1.as_deref())
    .bind(req.task_id)
    .bind(lock_row.version)
    .execute(&mut **tx)
    .await?;
    if updated.rows_affected() != 1 {
        // Someone else advanced `version` between our FOR UPDATE read and
        // this write — shouldn't happen under the row lock, but treat it as
        // a conflict rather than silently overwriting.
        return Err(MoneyError::Conflict);
    }

    if let Some(target) = target_task_status {
        sqlx::query("UPDATE tasks SET status = $1 WHERE id = $2")
            .bind(target)
            .bind(req.task_id)
            .execute(&mut **tx)
            .await?;
    }

    // Step 10: award XP, exactly once, only on a real RELEASE_PAYOUT landing
    // in `released` (spec §4.6 hooks off this transition, not off task
    // completion, so a disputed-then-released path still pays out).
    let xp_awarded = if req.event == MoneyEventType::ReleasePayout {
        let hustler_id = task
            .hustler_id
            .ok_or_else(|| MoneyError::InvariantViolation("release with no hustler".into()))?;
        let outcome =
            xp_service::award_xp_for_task(tx, req.task_id, hustler_id, task.price_cents, now)
                .await?;
        Some(outcome.final_xp)
    } else {
        None
    };

    // Step 11: record the replay guard entries and the audit trail in the
    // same transaction as everything above, then let the caller commit.
    replay_guard::record_processed(tx, req.event_id, req.external_event_id.as_deref()).await?;
    record_audit(tx, req, &ledger_ulid, now).await?;

    Ok(HandleOutcome {
        new_money_state: new_state,
        ledger_tx_id: ledger_ulid,
        xp_awarded,
        idempotent_replay: false,
    })
}

/// Maps a money event onto the paired task-status transition it implies, if
/// any, consulting `task_state_machine`/`proof_state_machine` for the
/// guards. Not every money event moves the task status (e.g. a dispute
/// split does not reopen a completed task).
async fn validate_paired_task_transition<C: PspClient>(
    tx: &mut Transaction<'_, Postgres>,
    task: &Task,
    req: &HandleRequest<'_, C>,
    _now: DateTime<Utc>,
) -> MoneyResult<Option<TaskStatus>> {
    match req.event {
        MoneyEventType::ReleasePayout => {
            let proof_status: ProofStatus = sqlx::query_scalar(
                "SELECT status FROM proofs WHERE task_id = $1 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(task.id)
            .fetch_optional(&mut **tx)
            .await?
            .unwrap_or(ProofStatus::None);
            if proof_state_machine::blocks_release(proof_status) {
                return Err(MoneyError::InvariantViolation(format!(
                    "RELEASE_PAYOUT refused: proof status {proof_status:?} blocks release"
                )));
            }
            let ctx = TransitionContext {
                money_state: Some(MoneyState::Held),
                has_hustler: task.hustler_id.is_some(),
                has_proof: true,
                proof_accepted: proof_status == ProofStatus::Accepted,
                has_admin: req.actor.admin_id.is_some(),
                has_reason: req.actor.dispute_reason.is_some(),
            };
            let event = if task.status == TaskStatus::Disputed {
                TaskEvent::ResolveDispute
            } else {
                TaskEvent::Complete
            };
            Ok(Some(task_state_machine::validate(task.status, event, &ctx)?))
        }
        MoneyEventType::DisputeOpen => {
            let ctx = TransitionContext {
                money_state: Some(MoneyState::Held),
                has_hustler: task.hustler_id.is_some(),
                has_proof: true,
                proof_accepted: false,
                has_admin: req.actor.admin_id.is_some(),
                has_reason: req.actor.dispute_reason.is_some(),
            };
            Ok(Some(task_state_machine::validate(
                task.status,
                TaskEvent::OpenDispute,
                &ctx,
            )?))
        }
        MoneyEventType::DisputeResolveRefund | MoneyEventType::DisputeResolveSplit => {
            let ctx = TransitionContext {
                money_state: Some(MoneyState::LockedDispute),
                has_hustler: task.hustler_id.is_some(),
                has_proof: true,
                proof_accepted: true,
                has_admin: req.actor.admin_id.is_some(),
                has_reason: req.actor.dispute_reason.is_some(),
            };
            Ok(Some(task_state_machine::validate(
                task.status,
                TaskEvent::ResolveDispute,
                &ctx,
            )?))
        }
        MoneyEventType::HoldEscrow | MoneyEventType::RefundEscrow | MoneyEventType::DisputeResolveRelease => {
            Ok(None)
        }
    }
}

/// Looks up (or lazily creates, for per-task escrow accounts) the ledger
/// account for an `(owner_type, owner_id, account_type)` triple. `name` is
/// the spec's canonical label for the account (e.g. "Task Escrow", "Poster
/// Receivable") and is only used on first creation.
async fn account_for(
    tx: &mut Transaction<'_, Postgres>,
    owner_type: AccountOwnerType,
    owner_id: Uuid,
    account_type: AccountType,
    name: &str,
) -> MoneyResult<Uuid> {
    if let Some(id) = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM ledger_accounts WHERE owner_type = $1 AND owner_id = $2 AND type = $3",
    )
    .bind(owner_type)
    .bind(owner_id)
    .bind(account_type)
    .fetch_optional(&mut **tx)
    .await?
    {
        return Ok(id);
    }
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO ledger_accounts (id, owner_type, owner_id, type, name, balance_cents)
         VALUES ($1, $2, $3, $4, $5, 0)",
    )
    .bind(id)
    .bind(owner_type)
    .bind(owner_id)
    .bind(account_type)
    .bind(name)
    .execute(&mut **tx)
    .await?;
    Ok(id)
}

const PLATFORM_ID: Uuid = Uuid::nil();

/// Builds the double-entry legs for `req.event`, calls the PSP bridge for
/// the external leg, and commits the ledger transaction. Returns the
/// committed ULID and any PSP ids the lock row should remember.
async fn apply_money_event<C: PspClient>(
    pool: &PgPool,
    tx: &mut Transaction<'_, Postgres>,
    task: &Task,
    req: &HandleRequest<'_, C>,
    idempotency_key: &str,
) -> MoneyResult<(ulid::Ulid, (Option<String>, Option<String>))> {
    let escrow =
        account_for(tx, AccountOwnerType::Task, task.id, AccountType::Liability, "Task Escrow")
            .await?;
    let platform_revenue = account_for(
        tx,
        AccountOwnerType::Platform,
        PLATFORM_ID,
        AccountType::Equity,
        "Platform Revenue",
    )
    .await?;
    let poster_wallet = account_for(
        tx,
        AccountOwnerType::User,
        task.poster_id,
        AccountType::Liability,
        "Poster Receivable",
    )
    .await?;

    match req.event {
        MoneyEventType::HoldEscrow => {
            let obj = req
                .psp_bridge
                .capture_payment_intent(
                    pool,
                    CaptureRequest {
                        payment_intent_id: format!("pi_{}", task.id),
                    },
                    idempotency_key,
                )
                .await?;
            let entries = [
                EntryInput {
                    account_id: poster_wallet,
                    direction: Direction::Debit,
                    amount_cents: task.price_cents,
                },
                EntryInput {
                    account_id: escrow,
                    direction: Direction::Credit,
                    amount_cents: task.price_cents,
                },
            ];
            let ulid = commit_entries(tx, idempotency_key, LedgerTxType::Hold, "hold escrow", &entries)
                .await?;
            Ok((ulid, (Some(obj.psp_id), None)))
        }
        MoneyEventType::ReleasePayout => {
            let hustler_id = task
                .hustler_id
                .ok_or_else(|| MoneyError::InvariantViolation("release with no hustler".into()))?;
            let hustler_wallet =
                account_for(tx, AccountOwnerType::User, hustler_id, AccountType::Liability, "Hustler Receivable")
                    .await?;
            let fee = req.fees.fee_for(&FeeContext { task });
            let net = task.price_cents - fee;

            let obj = req
                .psp_bridge
                .create_transfer(
                    pool,
                    TransferRequest {
                        amount_cents: net,
                        currency: "USD".into(),
                        destination: format!("acct_{hustler_id}"),
                        transfer_group: Some(task.id.to_string()),
                        metadata: serde_json::json!({ "task_id": task.id }),
                    },
                    idempotency_key,
                )
                .await?;

            let mut entries = vec![
                EntryInput {
                    account_id: escrow,
                    direction: Direction::Debit,
                    amount_cents: task.price_cents,
                },
                EntryInput {
                    account_id: hustler_wallet,
                    direction: Direction::Credit,
                    amount_cents: net,
                },
            ];
            if fee > 0 {
                entries.push(EntryInput {
                    account_id: platform_revenue,
                    direction: Direction::Credit,
                    amount_cents: fee,
                });
            }
            let ulid = commit_entries(
                tx,
                idempotency_key,
                LedgerTxType::Release,
                "release payout",
                &entries,
            )
            .await?;
            Ok((ulid, (None, obj.charge_id)))
        }
        MoneyEventType::RefundEscrow | MoneyEventType::DisputeResolveRefund => {
            let obj = req
                .psp_bridge
                .create_refund(
                    pool,
                    RefundRequest {
                        payment_intent_id: format!("pi_{}", task.id),
                        amount_cents: Some(task.price_cents),
                    },
                    idempotency_key,
                )
                .await?;
            let entries = [
                EntryInput {
                    account_id: escrow,
                    direction: Direction::Debit,
                    amount_cents: task.price_cents,
                },
                EntryInput {
                    account_id: poster_wallet,
                    direction: Direction::Credit,
                    amount_cents: task.price_cents,
                },
            ];
            let ulid = commit_entries(
                tx,
                idempotency_key,
                LedgerTxType::Refund,
                "refund escrow",
                &entries,
            )
            .await?;
            Ok((ulid, (None, obj.charge_id)))
        }
        MoneyEventType::DisputeResolveRelease => {
            let hustler_id = task
                .hustler_id
                .ok_or_else(|| MoneyError::InvariantViolation("release with no hustler".into()))?;
            let hustler_wallet =
                account_for(tx, AccountOwnerType::User, hustler_id, AccountType::Liability, "Hustler Receivable")
                    .await?;
            let fee = req.fees.fee_for(&FeeContext { task });
            let net = task.price_cents - fee;
            let obj = req
                .psp_bridge
                .create_transfer(
                    pool,
                    TransferRequest {
                        amount_cents: net,
                        currency: "USD".into(),
                        destination: format!("acct_{hustler_id}"),
                        transfer_group: Some(task.id.to_string()),
                        metadata: serde_json::json!({ "task_id": task.id, "dispute_resolution": "release" }),
                    },
                    idempotency_key,
                )
                .await?;
            let mut entries = vec![
                EntryInput {
                    account_id: escrow,
                    direction: Direction::Debit,
                    amount_cents: task.price_cents,
                },
                EntryInput {
                    account_id: hustler_wallet,
                    direction: Direction::Credit,
                    amount_cents: net,
                },
            ];
            if fee > 0 {
                entries.push(EntryInput {
                    account_id: platform_revenue,
                    direction: Direction::Credit,
                    amount_cents: fee,
                });
            }
            let ulid = commit_entries(
                tx,
                idempotency_key,
                LedgerTxType::DisputeResolveSplit,
                "dispute resolved: release",
                &entries,
            )
            .await?;
            Ok((ulid, (None, obj.charge_id)))
        }
        MoneyEventType::DisputeResolveSplit => {
            let hustler_id = task
                .hustler_id
                .ok_or_else(|| MoneyError::InvariantViolation("split with no hustler".into()))?;
            let hustler_wallet =
                account_for(tx, AccountOwnerType::User, hustler_id, AccountType::Liability, "Hustler Receivable")
                    .await?;
            let hustler_cut = req.actor.split_hustler_cents.ok_or_else(|| {
                MoneyError::InvariantViolation("DISPUTE_RESOLVE_SPLIT requires split_hustler_cents".into())
            })?;
            if !(0..=task.price_cents).contains(&hustler_cut) {
                return Err(MoneyError::InvariantViolation(format!(
                    "split amount {hustler_cut} outside [0, {}]",
                    task.price_cents
                )));
            }
            let poster_cut = task.price_cents - hustler_cut;

            let obj = req
                .psp_bridge
                .create_transfer(
                    pool,
                    TransferRequest {
                        amount_cents: hustler_cut,
                        currency: "USD".into(),
                        destination: format!("acct_{hustler_id}"),
                        transfer_group: Some(task.id.to_string()),
                        metadata: serde_json::json!({ "task_id": task.id, "dispute_resolution": "split" }),
                    },
                    idempotency_key,
                )
                .await?;

            let mut entries = vec![EntryInput {
                account_id: escrow,
                direction: Direction::Debit,
                amount_cents: task.price_cents,
            }];
            if hustler_cut > 0 {
                entries.push(EntryInput {
                    account_id: hustler_wallet,
                    direction: Direction::Credit,
                    amount_cents: hustler_cut,
                });
            }
            if poster_cut > 0 {
                entries.push(EntryInput {
                    account_id: poster_wallet,
                    direction: Direction::Credit,
                    amount_cents: poster_cut,
                });
            }
            let ulid = commit_entries(
                tx,
                idempotency_key,
                LedgerTxType::DisputeResolveSplit,
                "dispute resolved: split",
                &entries,
            )
            .await?;
            Ok((ulid, (None, obj.charge_id)))
        }
    }
}

async fn commit_entries(
    tx: &mut Transaction<'_, Postgres>,
    idempotency_key: &str,
    tx_type: LedgerTxType,
    description: &str,
    entries: &[EntryInput],
) -> MoneyResult<ulid::Ulid> {
    let outcome = ledger::prepare(
        tx,
        idempotency_key,
        tx_type,
        description,
        serde_json::json!({}),
        entries,
    )
    .await?;
    if !outcome.reused {
        ledger::commit(tx, outcome.ulid).await?;
    }
    Ok(outcome.ulid)
}

async fn record_audit<C: PspClient>(
    tx: &mut Transaction<'_, Postgres>,
    req: &HandleRequest<'_, C>,
    ledger_ulid: &ulid::Ulid,
    now: DateTime<Utc>,
) -> MoneyResult<()> {
    sqlx::query(
        "INSERT INTO money_events_audit
            (event_id, task_id, event_type, ledger_transaction_id, admin_id, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(req.event_id)
    .bind(req.task_id)
    .bind(req.event)
    .bind(ledger_ulid.to_string())
    .bind(req.actor.admin_id)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classifies_conflict_as_retryable() {
        assert!(is_retryable(&MoneyError::Conflict));
        assert!(!is_retryable(&MoneyError::InvariantViolation("x".into())));
    }
}
