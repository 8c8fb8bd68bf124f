//! Project status transitions.
//!
//! ```text
//! DRAFT ──▶ PROCESSING ──▶ COMPLETED
//!               │  ▲            │
//!               ▼  └────────────┤   (re-generation)
//!            FAILED ────────────┘
//! ```
//!
//! PROCESSING → PROCESSING is accepted: a second attempt for a project that
//! is already being processed is a concurrency concern, not a state error.

use crate::Status;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: Status,
    pub to: Status,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Draft, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Processing)
                | (Failed, Processing)
        )
    }

    pub fn transition(self, next: Status) -> Result<Status, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }
}
