//! Order-result state machine.
//!
//! # Design
//!
//! Explicit transition table for a single order's lifecycle on the execution
//! venue. Every status update flows through [`validate_transition`], which
//! enforces two invariants:
//!
//! 1. **Legal transitions only.** Illegal updates return [`TransitionError`];
//!    callers treat that as an OMS inconsistency requiring investigation.
//! 2. **Terminal absorption.** FILLED / CANCELED / EXPIRED / REJECTED never
//!    transition out; re-applying the same terminal status is a no-op
//!    (idempotent replay on restart).
//!
//! ```text
//! PENDING → SUBMITTED → PARTIALLY_FILLED → FILLED
//!                                       → CANCELED
//!                                       → EXPIRED
//!                                       → REJECTED
//!                     → UNKNOWN
//! ```
//!
//! `UNKNOWN` is transient: it may resolve to any live or terminal state once
//! a query succeeds. Late fills arriving while a cancel is in flight are
//! accepted (the venue may fill before processing the cancel).

use pf_schemas::OrderStatus;

/// Returned when a status update is not a legal transition.
///
/// Callers MUST treat this as an alert condition: it means the local view
/// and the venue's reported lifecycle have diverged in an impossible way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal order transition: {} → {}",
            self.from.as_str(),
            self.to.as_str()
        )
    }
}

impl std::error::Error for TransitionError {}

/// Validate one status transition. Same-status updates are always legal
/// (fill quantity may still change on a PARTIALLY_FILLED refresh).
pub fn validate_transition(from: OrderStatus, to: OrderStatus) -> Result<(), TransitionError> {
    use OrderStatus::*;

    if from == to {
        return Ok(());
    }

    let legal = match (from, to) {
        // Submit outcomes.
        (Pending, Submitted | Rejected | Unknown) => true,

        // Live order progress; Unknown covers query timeouts at any point.
        (Submitted, PartiallyFilled | Filled | Canceled | Expired | Rejected | Unknown) => true,
        (PartiallyFilled, Filled | Canceled | Expired | Unknown) => true,

        // Unknown resolves to whatever the venue reports.
        (Unknown, Submitted | PartiallyFilled | Filled | Canceled | Expired | Rejected) => true,

        // Terminal states absorb; everything else is illegal.
        _ => false,
    };

    if legal {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}
