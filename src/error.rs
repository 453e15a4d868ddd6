//! Typed domain errors for the money/ledger core.
//!
//! Lower layers (DB triggers, PSP bridge validation) always win over higher
//! layers: a variant raised here from a trigger or a bridge guard is never
//! silently downgraded or retried without the caller re-reading state.

use uuid::Uuid;

/// Stable, user-facing error code. Never leaks internals; pairs with a
/// request id for correlation in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    InvariantViolation,
    InvalidTransition,
    IdempotentReplay,
    PspTimeout,
    PspApiError,
    BlockedByKillSwitch,
    LedgerDrift,
    Conflict,
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum MoneyError {
    /// Raised by a DB trigger: terminal-state mutation, append-only delete,
    /// zero-sum failure, non-positive amount, trust tier out of bounds.
    /// Never retried; propagated as-is; callers should log at CRITICAL.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Event not present in `next_allowed_events[]`, or a state-machine
    /// guard refused the transition. May be a legitimate race.
    #[error("invalid transition: {from} -{event}-> rejected ({reason})")]
    InvalidTransition {
        from: String,
        event: String,
        reason: String,
    },

    /// A duplicate delivery was observed; no side effects were applied.
    #[error("idempotent replay of event {event_id}")]
    IdempotentReplay { event_id: Uuid },

    /// The PSP call timed out; the result is unknown. Safe to retry with the
    /// same idempotency key — the Reaper will resume if this process dies.
    #[error("PSP call timed out: {0}")]
    PspTimeout(String),

    /// The PSP deterministically rejected the request. Recorded, not
    /// retried automatically.
    #[error("PSP rejected request: {0}")]
    PspApiError(String),

    /// The kill-switch is active; the operation was not attempted.
    #[error("blocked by kill-switch: {reason}")]
    BlockedByKillSwitch { reason: String },

    /// The reconciler found internal cash and external PSP balance out of
    /// sync. This itself triggers the kill-switch.
    #[error("ledger drift: internal={internal} external={external} drift={drift}")]
    LedgerDrift {
        internal: i64,
        external: i64,
        drift: i64,
    },

    /// A DB serialization failure. Retryable only after the caller
    /// re-reads state; never a blind retry.
    #[error("serialization conflict, re-read state before retrying")]
    Conflict,

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MoneyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MoneyError::InvariantViolation(_) => ErrorCode::InvariantViolation,
            MoneyError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            MoneyError::IdempotentReplay { .. } => ErrorCode::IdempotentReplay,
            MoneyError::PspTimeout(_) => ErrorCode::PspTimeout,
            MoneyError::PspApiError(_) => ErrorCode::PspApiError,
            MoneyError::BlockedByKillSwitch { .. } => ErrorCode::BlockedByKillSwitch,
            MoneyError::LedgerDrift { .. } => ErrorCode::LedgerDrift,
            MoneyError::Conflict => ErrorCode::Conflict,
            MoneyError::NotFound(_) => ErrorCode::NotFound,
            MoneyError::Db(e) if is_serialization_failure(e) => ErrorCode::Conflict,
            MoneyError::Db(_) | MoneyError::Other(_) => ErrorCode::InvariantViolation,
        }
    }

    /// Never safe to retry without re-evaluating state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MoneyError::InvariantViolation(_)
                | MoneyError::InvalidTransition { .. }
                | MoneyError::PspApiError(_)
        )
    }
}

/// PostgreSQL SQLSTATE codes that indicate a retryable transaction failure.
/// Retrying here means "re-begin the transaction and re-evaluate state" —
/// never a blind resend of the same write.
pub mod pg_error_codes {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
}

pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return matches!(
                code.as_ref(),
                pg_error_codes::SERIALIZATION_FAILURE | pg_error_codes::DEADLOCK_DETECTED
            );
        }
    }
    false
}

pub type MoneyResult<T> = Result<T, MoneyError>;
