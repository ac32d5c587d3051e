//! # Lifecycle
//!
//! The only place where status transitions are decided.
//!
//! Each method takes the status a record is in *now* and returns the status
//! it moves to, or `Error::Conflict` when the move is illegal. The backend
//! persists the result with a compare-and-set on the old status, so a
//! concurrent caller that lost the race re-reads and lands here with the new
//! status and gets its Conflict.

use crate::types::{ApprovalStatus, MilestoneStatus, VerificationDecision};
use crate::{Error, Result};

/// Signature progress of an approval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignatureTally {
    pub current: u32,
    /// Quorum snapshot taken when the approval was opened.
    pub required: u32,
}

impl SignatureTally {
    pub fn quorum_reached(&self) -> bool {
        self.current >= self.required
    }
}

impl ApprovalStatus {
    /// Record one more signature.
    ///
    /// Returns the new tally and the resulting status: `Approved` as soon as
    /// the tally meets the quorum, `Pending` otherwise. A tally that already
    /// meets its quorum never grows, which keeps `current <= required`.
    pub fn sign(self, tally: SignatureTally) -> Result<(SignatureTally, ApprovalStatus)> {
        if self != ApprovalStatus::Pending {
            return Err(Error::Conflict(
                "Transaction approval is no longer pending".to_string(),
            ));
        }
        if tally.quorum_reached() {
            return Err(Error::Conflict(
                "Transaction approval already has all required signatures".to_string(),
            ));
        }
        let next = SignatureTally {
            current: tally.current + 1,
            required: tally.required,
        };
        let status = if next.quorum_reached() {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Pending
        };
        Ok((next, status))
    }

    /// Approved → Executed.
    pub fn execute(self) -> Result<ApprovalStatus> {
        match self {
            ApprovalStatus::Approved => Ok(ApprovalStatus::Executed),
            ApprovalStatus::Pending => Err(Error::Conflict(
                "Transaction approval is not yet approved".to_string(),
            )),
            ApprovalStatus::Executed | ApprovalStatus::Refunded => Err(Error::Conflict(
                "Transaction approval has already been executed".to_string(),
            )),
        }
    }

    /// Executed → Refunded.
    pub fn refund(self) -> Result<ApprovalStatus> {
        match self {
            ApprovalStatus::Executed => Ok(ApprovalStatus::Refunded),
            _ => Err(Error::Conflict(
                "Only executed transactions can be refunded".to_string(),
            )),
        }
    }

    /// Position along Pending → Approved → Executed → Refunded.
    pub fn rank(self) -> u8 {
        match self {
            ApprovalStatus::Pending => 0,
            ApprovalStatus::Approved => 1,
            ApprovalStatus::Executed => 2,
            ApprovalStatus::Refunded => 3,
        }
    }

    /// Whether `self → to` is a step some operation can take.
    pub fn can_become(self, to: ApprovalStatus) -> bool {
        matches!(
            (self, to),
            (ApprovalStatus::Pending, ApprovalStatus::Pending)
                | (ApprovalStatus::Pending, ApprovalStatus::Approved)
                | (ApprovalStatus::Approved, ApprovalStatus::Executed)
                | (ApprovalStatus::Executed, ApprovalStatus::Refunded)
        )
    }
}

impl MilestoneStatus {
    /// Owner reports the work done.
    ///
    /// Accepted from Pending, and from Completed so proof can be resubmitted
    /// before review. Reviewed or released milestones cannot be reopened.
    pub fn complete(self) -> Result<MilestoneStatus> {
        match self {
            MilestoneStatus::Pending | MilestoneStatus::Completed => Ok(MilestoneStatus::Completed),
            other => Err(Error::Conflict(format!(
                "Milestone is already {other} and cannot be marked completed"
            ))),
        }
    }

    /// Completed → Verified on approval, Completed → Pending on rejection.
    pub fn verify(self, decision: VerificationDecision) -> Result<MilestoneStatus> {
        if self != MilestoneStatus::Completed {
            return Err(Error::Conflict(
                "Milestone must be completed before verification".to_string(),
            ));
        }
        Ok(match decision {
            VerificationDecision::Approved => MilestoneStatus::Verified,
            VerificationDecision::Rejected => MilestoneStatus::Pending,
        })
    }

    /// Verified → Released.
    pub fn release(self) -> Result<MilestoneStatus> {
        match self {
            MilestoneStatus::Verified => Ok(MilestoneStatus::Released),
            _ => Err(Error::Conflict(
                "Milestone must be verified before releasing funds".to_string(),
            )),
        }
    }

    pub fn can_become(self, to: MilestoneStatus) -> bool {
        matches!(
            (self, to),
            (MilestoneStatus::Pending, MilestoneStatus::Completed)
                | (MilestoneStatus::Completed, MilestoneStatus::Completed)
                | (MilestoneStatus::Completed, MilestoneStatus::Verified)
                | (MilestoneStatus::Completed, MilestoneStatus::Pending)
                | (MilestoneStatus::Verified, MilestoneStatus::Released)
        )
    }
}
