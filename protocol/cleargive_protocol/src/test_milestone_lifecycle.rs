use crate::invariants::{
    assert_release_has_reference, assert_released_within_amount, assert_valid_milestone_transition,
};
use crate::{
    release_reference, Amount, ApprovalStatus, Error, Milestone, MilestoneStatus,
    TransactionApproval, VerificationDecision,
};

fn milestone(id: i64, amount: i64) -> Milestone {
    Milestone {
        id,
        approval_id: 7,
        name: format!("Phase {id}"),
        description: "Deliver supplies".to_string(),
        amount: Amount::units(amount),
        due_date: None,
        completion_date: None,
        verification_proof: None,
        status: MilestoneStatus::Pending,
        tx_hash: None,
        created_at: 0,
        updated_at: 0,
    }
}

fn step(
    m: &mut Milestone,
    transition: impl FnOnce(MilestoneStatus) -> Result<MilestoneStatus, Error>,
) -> Result<(), Error> {
    let next = transition(m.status)?;
    assert_valid_milestone_transition(m.status, next);
    m.status = next;
    Ok(())
}

fn drive_to_released(m: &mut Milestone) {
    step(m, |s| s.complete()).unwrap();
    step(m, |s| s.verify(VerificationDecision::Approved)).unwrap();
    step(m, |s| s.release()).unwrap();
    m.tx_hash = Some(release_reference(m.id));
}

#[test]
fn test_happy_path_reaches_released() {
    let mut m = milestone(1, 40);
    drive_to_released(&mut m);
    assert_eq!(m.status, MilestoneStatus::Released);
    assert_eq!(m.tx_hash.as_deref(), Some("milestone-tx-1"));
    assert_release_has_reference(&m);
}

#[test]
fn test_rejection_returns_completed_to_pending() {
    let mut m = milestone(1, 40);
    step(&mut m, |s| s.complete()).unwrap();
    step(&mut m, |s| s.verify(VerificationDecision::Rejected)).unwrap();
    assert_eq!(m.status, MilestoneStatus::Pending);

    // Must be re-completed before it can be reviewed again.
    assert!(matches!(
        m.status.verify(VerificationDecision::Approved),
        Err(Error::Conflict(_))
    ));
    step(&mut m, |s| s.complete()).unwrap();
    step(&mut m, |s| s.verify(VerificationDecision::Approved)).unwrap();
    assert_eq!(m.status, MilestoneStatus::Verified);
}

#[test]
fn test_release_requires_verified() {
    for status in [
        MilestoneStatus::Pending,
        MilestoneStatus::Completed,
        MilestoneStatus::Released,
    ] {
        assert!(matches!(status.release(), Err(Error::Conflict(_))));
    }
}

#[test]
fn test_complete_cannot_reopen_reviewed_milestones() {
    assert_eq!(
        MilestoneStatus::Completed.complete(),
        Ok(MilestoneStatus::Completed)
    );
    assert!(matches!(
        MilestoneStatus::Verified.complete(),
        Err(Error::Conflict(_))
    ));
    assert!(matches!(
        MilestoneStatus::Released.complete(),
        Err(Error::Conflict(_))
    ));
}

#[test]
fn test_cancelled_is_unreachable() {
    let all = [
        MilestoneStatus::Pending,
        MilestoneStatus::Completed,
        MilestoneStatus::Verified,
        MilestoneStatus::Released,
        MilestoneStatus::Cancelled,
    ];
    for from in all {
        assert!(!from.can_become(MilestoneStatus::Cancelled));
    }
    assert!(MilestoneStatus::Cancelled.complete().is_err());
}

#[test]
fn test_released_total_checked_against_approval() {
    let approval = TransactionApproval {
        id: 7,
        charity_id: 1,
        amount: Amount::units(100),
        description: "Field kits".to_string(),
        category: String::new(),
        requested_by_id: 10,
        required_signatures: 1,
        current_signatures: 1,
        status: ApprovalStatus::Executed,
        tx_hash: Some("mock-transaction-hash-7".to_string()),
        refund_amount: None,
        created_at: 0,
        updated_at: 0,
    };
    let mut first = milestone(1, 40);
    let mut second = milestone(2, 60);
    drive_to_released(&mut first);
    drive_to_released(&mut second);
    assert_released_within_amount(&approval, &[first, second, milestone(3, 500)]);
}
