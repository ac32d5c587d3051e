#![allow(dead_code)]

use crate::types::{
    Amount, ApprovalStatus, Milestone, MilestoneStatus, TransactionApproval,
};

/// Signature count never passes the quorum snapshot.
pub fn assert_signatures_within_quorum(approval: &TransactionApproval) {
    assert!(
        approval.current_signatures <= approval.required_signatures,
        "approval {} has {} signatures for a quorum of {}",
        approval.id,
        approval.current_signatures,
        approval.required_signatures
    );
}

/// A Pending approval has not met its quorum; any later status has.
pub fn assert_status_matches_tally(approval: &TransactionApproval) {
    let reached = approval.current_signatures >= approval.required_signatures;
    match approval.status {
        ApprovalStatus::Pending => assert!(
            !reached,
            "approval {} is pending with a full quorum",
            approval.id
        ),
        _ => assert!(
            reached,
            "approval {} is {} without a quorum",
            approval.id, approval.status
        ),
    }
}

/// Approval amounts are strictly positive.
pub fn assert_amount_positive(approval: &TransactionApproval) {
    assert!(
        !approval.amount.is_zero(),
        "approval {} has a zero amount",
        approval.id
    );
}

/// Executed and refunded approvals carry an external reference.
pub fn assert_reference_after_execution(approval: &TransactionApproval) {
    if approval.status.rank() >= ApprovalStatus::Executed.rank() {
        assert!(
            approval.tx_hash.is_some(),
            "approval {} is {} without a reference",
            approval.id,
            approval.status
        );
    }
}

/// Approval status never moves backwards or skips a stage.
pub fn assert_valid_approval_transition(from: ApprovalStatus, to: ApprovalStatus) {
    assert!(
        from.can_become(to),
        "invalid approval transition from {from:?} to {to:?}"
    );
}

/// Milestone status only moves forward, except rejection back to Pending.
pub fn assert_valid_milestone_transition(from: MilestoneStatus, to: MilestoneStatus) {
    assert!(
        from.can_become(to),
        "invalid milestone transition from {from:?} to {to:?}"
    );
}

/// Released milestones carry a disbursement reference.
pub fn assert_release_has_reference(milestone: &Milestone) {
    if milestone.status == MilestoneStatus::Released {
        assert!(
            milestone.tx_hash.is_some(),
            "milestone {} released without a reference",
            milestone.id
        );
    }
}

/// Released milestone totals stay within the approval amount.
pub fn assert_released_within_amount(approval: &TransactionApproval, milestones: &[Milestone]) {
    let released = Amount::sum(
        milestones
            .iter()
            .filter(|m| m.approval_id == approval.id && m.status == MilestoneStatus::Released)
            .map(|m| m.amount),
    )
    .expect("released total overflows");
    assert!(
        released <= approval.amount,
        "approval {} released {} of {}",
        approval.id,
        released,
        approval.amount
    );
}

/// Run all stateless approval invariants.
pub fn assert_all_approval_invariants(approval: &TransactionApproval) {
    assert_signatures_within_quorum(approval);
    assert_status_matches_tally(approval);
    assert_amount_positive(approval);
    assert_reference_after_execution(approval);
}
