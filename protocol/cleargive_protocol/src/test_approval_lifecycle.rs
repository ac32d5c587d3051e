use crate::invariants::{
    assert_all_approval_invariants, assert_signatures_within_quorum,
    assert_valid_approval_transition,
};
use crate::{
    calculate_refund, execution_reference, Amount, ApprovalStatus, Error, SignatureTally,
    TransactionApproval,
};

fn open_approval(amount: i64, required: u32) -> TransactionApproval {
    TransactionApproval {
        id: 7,
        charity_id: 1,
        amount: Amount::units(amount),
        description: "Field kits".to_string(),
        category: "programs".to_string(),
        requested_by_id: 10,
        required_signatures: required,
        current_signatures: 0,
        status: ApprovalStatus::Pending,
        tx_hash: None,
        refund_amount: None,
        created_at: 0,
        updated_at: 0,
    }
}

fn tally(approval: &TransactionApproval) -> SignatureTally {
    SignatureTally {
        current: approval.current_signatures,
        required: approval.required_signatures,
    }
}

/// Apply one signature the way the service does, checking the transition.
fn sign(approval: &mut TransactionApproval) -> Result<(), Error> {
    let (next, status) = approval.status.sign(tally(approval))?;
    assert_valid_approval_transition(approval.status, status);
    approval.current_signatures = next.current;
    approval.status = status;
    assert_signatures_within_quorum(approval);
    Ok(())
}

fn execute(approval: &mut TransactionApproval) -> Result<(), Error> {
    let status = approval.status.execute()?;
    assert_valid_approval_transition(approval.status, status);
    approval.status = status;
    approval.tx_hash = Some(execution_reference(approval.id));
    Ok(())
}

#[test]
fn test_two_of_two_flips_to_approved_on_second_signature() {
    let mut approval = open_approval(100, 2);

    sign(&mut approval).unwrap();
    assert_eq!(approval.status, ApprovalStatus::Pending);
    assert_eq!(approval.current_signatures, 1);

    sign(&mut approval).unwrap();
    assert_eq!(approval.status, ApprovalStatus::Approved);
    assert_eq!(approval.current_signatures, 2);
    assert_all_approval_invariants(&approval);
}

#[test]
fn test_single_signature_policy_approves_immediately() {
    let mut approval = open_approval(5, 1);
    sign(&mut approval).unwrap();
    assert_eq!(approval.status, ApprovalStatus::Approved);
}

#[test]
fn test_signing_after_quorum_is_conflict_and_count_unchanged() {
    let mut approval = open_approval(100, 2);
    sign(&mut approval).unwrap();
    sign(&mut approval).unwrap();

    let err = sign(&mut approval).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(approval.current_signatures, 2);
}

#[test]
fn test_stale_pending_tally_at_quorum_cannot_overcount() {
    // A racing writer may observe Pending with the quorum already met.
    let tally = SignatureTally {
        current: 3,
        required: 3,
    };
    assert!(matches!(
        ApprovalStatus::Pending.sign(tally),
        Err(Error::Conflict(_))
    ));
}

#[test]
fn test_execute_requires_approved() {
    let mut approval = open_approval(100, 2);
    let err = execute(&mut approval).unwrap_err();
    assert_eq!(
        err,
        Error::Conflict("Transaction approval is not yet approved".to_string())
    );
    assert_eq!(approval.status, ApprovalStatus::Pending);
    assert!(approval.tx_hash.is_none());
}

#[test]
fn test_full_lifecycle_with_refund() {
    let mut approval = open_approval(100, 1);
    sign(&mut approval).unwrap();
    execute(&mut approval).unwrap();
    assert_eq!(approval.tx_hash.as_deref(), Some("mock-transaction-hash-7"));

    let refund = calculate_refund(approval.amount, Amount::units(40)).unwrap();
    let status = approval.status.refund().unwrap();
    assert_valid_approval_transition(approval.status, status);
    approval.status = status;
    approval.refund_amount = Some(refund);

    assert_eq!(refund, Amount::units(60));
    assert_eq!(approval.status, ApprovalStatus::Refunded);
    assert_all_approval_invariants(&approval);
}

#[test]
fn test_second_refund_is_conflict() {
    assert_eq!(ApprovalStatus::Executed.refund(), Ok(ApprovalStatus::Refunded));
    assert!(matches!(
        ApprovalStatus::Refunded.refund(),
        Err(Error::Conflict(_))
    ));
}

#[test]
fn test_no_transition_moves_backwards() {
    let all = [
        ApprovalStatus::Pending,
        ApprovalStatus::Approved,
        ApprovalStatus::Executed,
        ApprovalStatus::Refunded,
    ];
    for from in all {
        for to in all {
            if from.can_become(to) {
                assert!(to.rank() >= from.rank(), "{from:?} -> {to:?} regresses");
                assert!(to.rank() <= from.rank() + 1, "{from:?} -> {to:?} skips");
            }
        }
    }
    assert!(ApprovalStatus::Approved.sign(SignatureTally { current: 1, required: 1 }).is_err());
    assert!(ApprovalStatus::Executed.execute().is_err());
    assert!(ApprovalStatus::Approved.refund().is_err());
}
