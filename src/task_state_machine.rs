//! TaskStateMachine (spec §4.5): consulted, never bypassed, by the money
//! engine and by public task-lifecycle handlers.

use crate::error::{MoneyError, MoneyResult};
use crate::models::{MoneyState, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Accept,
    SubmitProof,
    Complete,
    OpenDispute,
    ResolveDispute,
    Cancel,
    Expire,
}

/// Preconditions the caller must already have satisfied (money state,
/// proof status, actor identity) before `validate` will allow a transition.
pub struct TransitionContext {
    pub money_state: Option<MoneyState>,
    pub has_hustler: bool,
    pub has_proof: bool,
    pub proof_accepted: bool,
    pub has_admin: bool,
    pub has_reason: bool,
}

/// Validates a task status transition per the edge table in spec §4.5.
/// Returns the target status or a typed `InvalidTransition`/`InvariantViolation`.
pub fn validate(
    from: TaskStatus,
    event: TaskEvent,
    ctx: &TransitionContext,
) -> MoneyResult<TaskStatus> {
    if from.is_terminal() {
        return Err(MoneyError::InvariantViolation(format!(
            "task already terminal in state {from:?}"
        )));
    }

    let invalid = |reason: &str| {
        Err(MoneyError::InvalidTransition {
            from: format!("{from:?}"),
            event: format!("{event:?}"),
            reason: reason.to_string(),
        })
    };

    match (from, event) {
        (TaskStatus::Open, TaskEvent::Accept) => {
            if !ctx.has_hustler {
                return invalid("ACCEPTED requires a hustler id");
            }
            if ctx.money_state != Some(MoneyState::Held) {
                return invalid("ACCEPTED requires money state = held");
            }
            Ok(TaskStatus::Accepted)
        }
        (TaskStatus::Accepted, TaskEvent::SubmitProof) => {
            if !ctx.has_proof {
                return invalid("PROOF_SUBMITTED requires a proof id");
            }
            Ok(TaskStatus::ProofSubmitted)
        }
        (TaskStatus::ProofSubmitted, TaskEvent::Complete) => {
            // INV-2 / INV-3: completion requires accepted proof AND money held.
            if !ctx.proof_accepted {
                return invalid("COMPLETED requires proof status = accepted");
            }
            if ctx.money_state != Some(MoneyState::Held) {
                return invalid("COMPLETED requires money state = held");
            }
            Ok(TaskStatus::Completed)
        }
        (TaskStatus::ProofSubmitted, TaskEvent::OpenDispute) => {
            if !ctx.has_reason {
                return invalid("DISPUTED requires a reason");
            }
            Ok(TaskStatus::Disputed)
        }
        (TaskStatus::Disputed, TaskEvent::ResolveDispute) => {
            if !ctx.has_admin {
                return invalid("DISPUTED -> COMPLETED requires an admin id");
            }
            Ok(TaskStatus::Completed)
        }
        (_, TaskEvent::Cancel) => Ok(TaskStatus::Cancelled),
        (_, TaskEvent::Expire) => Ok(TaskStatus::Expired),
        _ => invalid("no such edge in the task state machine"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TransitionContext {
        TransitionContext {
            money_state: Some(MoneyState::Held),
            has_hustler: true,
            has_proof: true,
            proof_accepted: true,
            has_admin: true,
            has_reason: true,
        }
    }

    #[test]
    fn open_to_accepted_requires_held_money() {
        let mut c = ctx();
        c.money_state = Some(MoneyState::Pending);
        let err = validate(TaskStatus::Open, TaskEvent::Accept, &c).unwrap_err();
        assert!(matches!(err, MoneyError::InvalidTransition { .. }));
    }

    #[test]
    fn completion_requires_accepted_proof() {
        let mut c = ctx();
        c.proof_accepted = false;
        let err = validate(TaskStatus::ProofSubmitted, TaskEvent::Complete, &c).unwrap_err();
        assert!(matches!(err, MoneyError::InvalidTransition { .. }));
    }

    #[test]
    fn terminal_states_reject_everything() {
        let err = validate(TaskStatus::Completed, TaskEvent::Cancel, &ctx()).unwrap_err();
        assert!(matches!(err, MoneyError::InvariantViolation(_)));
    }

    #[test]
    fn happy_path_accept_submit_complete() {
        let c = ctx();
        assert_eq!(
            validate(TaskStatus::Open, TaskEvent::Accept, &c).unwrap(),
            TaskStatus::Accepted
        );
        assert_eq!(
            validate(TaskStatus::Accepted, TaskEvent::SubmitProof, &c).unwrap(),
            TaskStatus::ProofSubmitted
        );
        assert_eq!(
            validate(TaskStatus::ProofSubmitted, TaskEvent::Complete, &c).unwrap(),
            TaskStatus::Completed
        );
    }
}
