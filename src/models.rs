//! Shared domain types for the financial core: enums and row structs
//! mirroring the tables in `migrations/0001_init.sql`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Accepted,
    ProofSubmitted,
    Disputed,
    Completed,
    Cancelled,
    Expired,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "proof_status", rename_all = "snake_case")]
pub enum ProofStatus {
    None,
    Requested,
    Submitted,
    Analyzing,
    Escalated,
    Accepted,
    Rejected,
    Locked,
}

impl ProofStatus {
    /// Freeze rule of spec §4.5: RELEASE_PAYOUT must be refused while the
    /// proof is in one of these states.
    pub fn blocks_release(&self) -> bool {
        matches!(
            self,
            ProofStatus::Requested
                | ProofStatus::Submitted
                | ProofStatus::Analyzing
                | ProofStatus::Escalated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "money_state", rename_all = "snake_case")]
pub enum MoneyState {
    Pending,
    Held,
    Released,
    Refunded,
    LockedDispute,
    Failed,
}

impl MoneyState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MoneyState::Released | MoneyState::Refunded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "money_event_type", rename_all = "snake_case")]
pub enum MoneyEventType {
    HoldEscrow,
    ReleasePayout,
    RefundEscrow,
    DisputeOpen,
    DisputeResolveRefund,
    DisputeResolveRelease,
    DisputeResolveSplit,
}

impl MoneyEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoneyEventType::HoldEscrow => "HOLD_ESCROW",
            MoneyEventType::ReleasePayout => "RELEASE_PAYOUT",
            MoneyEventType::RefundEscrow => "REFUND_ESCROW",
            MoneyEventType::DisputeOpen => "DISPUTE_OPEN",
            MoneyEventType::DisputeResolveRefund => "DISPUTE_RESOLVE_REFUND",
            MoneyEventType::DisputeResolveRelease => "DISPUTE_RESOLVE_RELEASE",
            MoneyEventType::DisputeResolveSplit => "DISPUTE_RESOLVE_SPLIT",
        }
    }

    /// Whether this event requires a PSP Bridge call.
    pub fn requires_psp_call(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "account_owner_type", rename_all = "snake_case")]
pub enum AccountOwnerType {
    Platform,
    User,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "account_type", rename_all = "snake_case")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Expense,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "ledger_direction", rename_all = "snake_case")]
pub enum Direction {
    Debit,
    Credit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "ledger_tx_status", rename_all = "snake_case")]
pub enum LedgerTxStatus {
    Pending,
    Executing,
    Committed,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "dispute_status", rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    UnderReview,
    Resolved,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Task {
    pub id: Uuid,
    pub poster_id: Uuid,
    pub hustler_id: Option<Uuid>,
    pub price_cents: i64,
    pub status: TaskStatus,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MoneyStateLock {
    pub task_id: Uuid,
    pub current_state: MoneyState,
    pub next_allowed_events: Vec<MoneyEventType>,
    pub version: i32,
    pub psp_payment_intent_id: Option<String>,
    pub psp_charge_id: Option<String>,
    pub recovery_attempts: i32,
}

impl MoneyStateLock {
    pub fn allows(&self, event: MoneyEventType) -> bool {
        !self.current_state.is_terminal() && self.next_allowed_events.contains(&event)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub trust_tier: i16,
    pub xp: i64,
    pub level: i16,
    pub streak: i32,
    pub last_active_at: Option<DateTime<Utc>>,
}

/// Fully-realized next-state edge table for the money state machine.
/// `spec.md` §4.4 edges, expressed as data rather than scattered matches so
/// `Handle` can look up "what's legal from here" in one place.
pub fn next_allowed_events_for(state: MoneyState) -> Vec<MoneyEventType> {
    match state {
        MoneyState::Pending => vec![MoneyEventType::HoldEscrow],
        MoneyState::Held => vec![
            MoneyEventType::ReleasePayout,
            MoneyEventType::RefundEscrow,
            MoneyEventType::DisputeOpen,
        ],
        MoneyState::LockedDispute => vec![
            MoneyEventType::DisputeResolveRefund,
            MoneyEventType::DisputeResolveRelease,
            MoneyEventType::DisputeResolveSplit,
        ],
        MoneyState::Released | MoneyState::Refunded | MoneyState::Failed => vec![],
    }
}

pub fn target_state_for(event: MoneyEventType) -> MoneyState {
    match event {
        MoneyEventType::HoldEscrow => MoneyState::Held,
        MoneyEventType::ReleasePayout => MoneyState::Released,
        MoneyEventType::RefundEscrow => MoneyState::Refunded,
        MoneyEventType::DisputeOpen => MoneyState::LockedDispute,
        MoneyEventType::DisputeResolveRefund => MoneyState::Refunded,
        MoneyEventType::DisputeResolveRelease => MoneyState::Released,
        MoneyEventType::DisputeResolveSplit => MoneyState::Released,
    }
}
