//! # ClearGive Protocol
//!
//! Domain rules for releasing donated funds. A charity opens a transaction
//! approval, its owner and cosigners sign it until the quorum captured at
//! creation is reached, the owner executes it, and the money is then paid out
//! milestone by milestone once a cosigner has verified each one. Whatever is
//! left unreleased can be refunded.
//!
//! | Concern                 | Module                                  |
//! |-------------------------|-----------------------------------------|
//! | Records and amounts     | [`types`]                               |
//! | Who may act             | [`access`]                              |
//! | Approval state machine  | [`lifecycle`], on [`ApprovalStatus`]    |
//! | Milestone state machine | [`lifecycle`], on [`MilestoneStatus`]   |
//! | Refund arithmetic       | [`refund`]                              |
//!
//! ## Architecture
//!
//! This crate performs no I/O. The backend loads records, asks this crate
//! whether a transition is legal and what the next state is, and persists
//! the answer inside a single transaction.

pub mod access;
pub mod lifecycle;
pub mod refund;
pub mod types;

#[cfg(test)]
mod invariants;
#[cfg(test)]
mod test_approval_lifecycle;
#[cfg(test)]
mod test_milestone_lifecycle;

pub use access::{AuthenticatedCaller, CharityAccess, CosignerLookup, Role};
pub use lifecycle::SignatureTally;
pub use refund::calculate_refund;
pub use types::{
    Amount, ApprovalSignature, ApprovalStatus, BudgetCategory, Charity, Cosigner, Milestone,
    MilestoneStatus, MilestoneVerification, TransactionApproval, VerificationDecision,
};

use thiserror::Error;

/// Every failure a workflow step can report to its caller.
///
/// Persistence failures are not listed here; they belong to the layer that
/// owns the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed or missing input.
    #[error("{0}")]
    Validation(String),

    /// Charity, approval, milestone, category or cosigner absent.
    #[error("{0}")]
    NotFound(String),

    /// No credential, or one that resolves to nobody.
    #[error("{0}")]
    Unauthenticated(String),

    /// Authenticated, but lacking the relationship the step needs.
    #[error("{0}")]
    Forbidden(String),

    /// Wrong state for the transition, or a duplicate signature.
    #[error("{0}")]
    Conflict(String),
}

impl Error {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Placeholder reference recorded when an approval is executed.
///
/// No value moves on an external ledger; the reference only marks the
/// execution so it can be correlated later.
pub fn execution_reference(approval_id: i64) -> String {
    format!("mock-transaction-hash-{approval_id}")
}

/// Placeholder reference returned when a milestone is released.
pub fn release_reference(milestone_id: i64) -> String {
    format!("milestone-tx-{milestone_id}")
}
