//! Milestone workflow: create, complete, verify, release.
//!
//! Milestone operations match cosigners by their registered user id, not
//! by email.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use cleargive_protocol::{
    release_reference, Amount, AuthenticatedCaller, CharityAccess, CosignerLookup, Milestone,
    MilestoneStatus, MilestoneVerification, TransactionApproval, VerificationDecision,
};

use crate::db;
use crate::errors::{AppError, Result};
use crate::events::{self, EventKind, WorkflowEvent};
use crate::registry;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewMilestone {
    pub name: String,
    pub description: String,
    /// Decimal string.
    pub amount: String,
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Completion {
    pub proof: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Review {
    pub status: Option<VerificationDecision>,
    pub comments: String,
}

#[derive(Debug, Serialize)]
pub struct Verified {
    pub milestone: Milestone,
    pub verification: MilestoneVerification,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Released {
    pub milestone: Milestone,
    pub tx_hash: String,
}

async fn approval_and_access(
    conn: &mut SqliteConnection,
    approval_id: i64,
) -> Result<(TransactionApproval, CharityAccess)> {
    let approval = db::fetch_approval(&mut *conn, approval_id)
        .await?
        .ok_or_else(|| AppError::not_found("Transaction approval not found"))?;
    let access = registry::load_access(conn, approval.charity_id).await?;
    Ok((approval, access))
}

async fn lock_and_fetch(conn: &mut SqliteConnection, milestone_id: i64) -> Result<Milestone> {
    if !db::lock_milestone(&mut *conn, milestone_id).await? {
        return Err(AppError::not_found("Milestone not found"));
    }
    db::fetch_milestone(conn, milestone_id)
        .await?
        .ok_or_else(|| AppError::not_found("Milestone not found"))
}

/// Compare-and-set on status; zero rows means someone else moved it first.
fn ensure_swapped(rows: u64) -> Result<()> {
    if rows == 0 {
        return Err(AppError::conflict("Milestone changed concurrently"));
    }
    Ok(())
}

pub async fn create(
    pool: &SqlitePool,
    approval_id: i64,
    caller: &AuthenticatedCaller,
    input: NewMilestone,
) -> Result<Milestone> {
    let mut tx = pool.begin().await?;
    if !db::lock_approval(&mut tx, approval_id).await? {
        return Err(AppError::not_found("Transaction approval not found"));
    }
    let (approval, access) = approval_and_access(&mut tx, approval_id).await?;
    access.require_member(caller, CosignerLookup::Identity, "create milestones")?;

    let name = input.name.trim();
    let description = input.description.trim();
    if name.is_empty() || description.is_empty() || input.amount.trim().is_empty() {
        return Err(AppError::validation("Name, description and amount are required"));
    }
    let amount: Amount = input.amount.parse()?;
    if amount.is_zero() {
        return Err(AppError::validation("Amount must be greater than zero"));
    }

    let now = db::now();
    let id = sqlx::query(
        r#"
        INSERT INTO milestones
            (approval_id, name, description, amount, due_date, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        "#,
    )
    .bind(approval_id)
    .bind(name)
    .bind(description)
    .bind(amount.stroops())
    .bind(input.due_date.map(|d| d.timestamp()))
    .bind(MilestoneStatus::Pending.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    events::record(
        &mut tx,
        &WorkflowEvent::new(EventKind::MilestoneCreated, approval.charity_id, id, caller.id)
            .with_amount(amount)
            .with_detail(name),
    )
    .await?;

    let milestone = db::fetch_milestone(&mut tx, id)
        .await?
        .ok_or_else(|| AppError::not_found("Milestone not found"))?;
    tx.commit().await?;

    info!(approval_id, milestone_id = id, caller = caller.id, %amount, "milestone created");
    Ok(milestone)
}

/// Owner reports the work done. Re-completing a completed milestone
/// replaces its proof.
pub async fn complete(
    pool: &SqlitePool,
    milestone_id: i64,
    caller: &AuthenticatedCaller,
    input: Completion,
) -> Result<Milestone> {
    let mut tx = pool.begin().await?;
    let milestone = lock_and_fetch(&mut tx, milestone_id).await?;
    let (approval, access) = approval_and_access(&mut tx, milestone.approval_id).await?;
    access.require_owner(caller, "mark milestones as completed")?;
    let status = milestone.status.complete()?;

    let now = db::now();
    let swapped = sqlx::query(
        r#"
        UPDATE milestones
        SET    status = ?1, completion_date = ?2, verification_proof = ?3, updated_at = ?2
        WHERE  id = ?4 AND status = ?5
        "#,
    )
    .bind(status.as_str())
    .bind(now)
    .bind(input.proof.as_deref())
    .bind(milestone_id)
    .bind(milestone.status.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();
    ensure_swapped(swapped)?;

    events::record(
        &mut tx,
        &WorkflowEvent::new(
            EventKind::MilestoneCompleted,
            approval.charity_id,
            milestone_id,
            caller.id,
        ),
    )
    .await?;
    let milestone = db::fetch_milestone(&mut tx, milestone_id)
        .await?
        .ok_or_else(|| AppError::not_found("Milestone not found"))?;
    tx.commit().await?;

    info!(milestone_id, caller = caller.id, "milestone completed");
    Ok(milestone)
}

/// A cosigner accepts or rejects the completion. Rejection sends the
/// milestone back to pending.
pub async fn verify(
    pool: &SqlitePool,
    milestone_id: i64,
    caller: &AuthenticatedCaller,
    review: Review,
) -> Result<Verified> {
    let decision = review
        .status
        .ok_or_else(|| AppError::validation("Verification status is required"))?;

    let mut tx = pool.begin().await?;
    let mut milestone = lock_and_fetch(&mut tx, milestone_id).await?;
    let status = milestone.status.verify(decision)?;
    let (approval, access) = approval_and_access(&mut tx, milestone.approval_id).await?;
    access.require_cosigner(caller, CosignerLookup::Identity, "verify milestones")?;

    let now = db::now();
    let verification_id = sqlx::query(
        r#"
        INSERT INTO milestone_verifications (milestone_id, verifier_id, status, comments, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(milestone_id)
    .bind(caller.id)
    .bind(decision.as_str())
    .bind(&review.comments)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    let swapped = sqlx::query(
        "UPDATE milestones SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
    )
    .bind(status.as_str())
    .bind(now)
    .bind(milestone_id)
    .bind(milestone.status.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();
    ensure_swapped(swapped)?;

    let kind = match decision {
        VerificationDecision::Approved => EventKind::MilestoneVerified,
        VerificationDecision::Rejected => EventKind::MilestoneRejected,
    };
    let mut event = WorkflowEvent::new(kind, approval.charity_id, milestone_id, caller.id);
    if !review.comments.is_empty() {
        event = event.with_detail(review.comments.clone());
    }
    events::record(&mut tx, &event).await?;
    tx.commit().await?;

    info!(milestone_id, caller = caller.id, decision = decision.as_str(), "milestone reviewed");
    milestone.status = status;
    milestone.updated_at = now;
    Ok(Verified {
        milestone,
        verification: MilestoneVerification {
            id: verification_id,
            milestone_id,
            verifier_id: caller.id,
            status: decision,
            comments: review.comments,
            created_at: now,
        },
    })
}

/// Pay out a verified milestone. The budget ledger was already debited when
/// the parent approval was executed.
pub async fn release(
    pool: &SqlitePool,
    milestone_id: i64,
    caller: &AuthenticatedCaller,
) -> Result<Released> {
    let mut tx = pool.begin().await?;
    let mut milestone = lock_and_fetch(&mut tx, milestone_id).await?;
    let status = milestone.status.release()?;
    let (approval, access) = approval_and_access(&mut tx, milestone.approval_id).await?;
    access.require_owner(caller, "release milestone funds")?;

    let reference = release_reference(milestone_id);
    let now = db::now();
    let swapped = sqlx::query(
        r#"
        UPDATE milestones
        SET    status = ?1, tx_hash = ?2, updated_at = ?3
        WHERE  id = ?4 AND status = ?5
        "#,
    )
    .bind(status.as_str())
    .bind(&reference)
    .bind(now)
    .bind(milestone_id)
    .bind(milestone.status.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();
    ensure_swapped(swapped)?;

    let released_total =
        db::milestone_total(&mut tx, approval.id, MilestoneStatus::Released.as_str()).await?;
    if released_total > approval.amount {
        warn!(
            approval_id = approval.id,
            milestone_id,
            %released_total,
            approved = %approval.amount,
            "released milestones exceed the approved amount"
        );
    }

    events::record(
        &mut tx,
        &WorkflowEvent::new(
            EventKind::MilestoneReleased,
            approval.charity_id,
            milestone_id,
            caller.id,
        )
        .with_amount(milestone.amount)
        .with_detail(reference.clone()),
    )
    .await?;
    tx.commit().await?;

    info!(milestone_id, caller = caller.id, tx_hash = %reference, "milestone released");
    milestone.status = status;
    milestone.tx_hash = Some(reference.clone());
    milestone.updated_at = now;
    Ok(Released {
        milestone,
        tx_hash: reference,
    })
}

/// Milestones of an approval, in creation order.
pub async fn list(
    pool: &SqlitePool,
    approval_id: i64,
    caller: &AuthenticatedCaller,
) -> Result<Vec<Milestone>> {
    let mut conn = pool.acquire().await?;
    let (_, access) = approval_and_access(&mut conn, approval_id).await?;
    access.require_member(caller, CosignerLookup::Identity, "view milestones")?;
    db::fetch_milestones_for_approval(&mut conn, approval_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::{self, NewApproval};
    use crate::db::fixtures;
    use crate::registry::NewCosigner;

    struct Setup {
        pool: SqlitePool,
        owner: AuthenticatedCaller,
        cosigner: AuthenticatedCaller,
        /// Registered by email only, so milestone checks do not see them.
        email_cosigner: AuthenticatedCaller,
        approval_id: i64,
    }

    async fn setup() -> Setup {
        let pool = db::test_pool().await;
        let owner = fixtures::user(&pool, "owner").await;
        let cosigner = fixtures::user(&pool, "cosigner").await;
        let email_cosigner = fixtures::user(&pool, "mailonly").await;
        let charity = fixtures::charity(&pool, &owner).await;
        for (user_id, email) in [
            (Some(cosigner.id), cosigner.email.clone()),
            (None, email_cosigner.email.clone()),
        ] {
            registry::add_cosigner(
                &pool,
                charity.id,
                &owner,
                NewCosigner {
                    user_id,
                    email,
                    is_primary: false,
                },
            )
            .await
            .unwrap();
        }
        let approval = approvals::create(
            &pool,
            charity.id,
            &owner,
            NewApproval {
                amount: "100".to_string(),
                description: "School roof".to_string(),
                category: String::new(),
            },
        )
        .await
        .unwrap();
        Setup {
            pool,
            owner,
            cosigner,
            email_cosigner,
            approval_id: approval.id,
        }
    }

    fn phase(amount: &str) -> NewMilestone {
        NewMilestone {
            name: "Phase one".to_string(),
            description: "Materials delivered".to_string(),
            amount: amount.to_string(),
            due_date: None,
        }
    }

    fn review(decision: VerificationDecision, comments: &str) -> Review {
        Review {
            status: Some(decision),
            comments: comments.to_string(),
        }
    }

    fn proof() -> Completion {
        Completion {
            proof: Some("ipfs://receipt".to_string()),
        }
    }

    #[tokio::test]
    async fn create_uses_identity_lookup_and_validates() {
        let s = setup().await;
        let err = create(&s.pool, s.approval_id, &s.email_cosigner, phase("10"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "forbidden");

        let err = create(&s.pool, s.approval_id, &s.cosigner, phase(""))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let err = create(&s.pool, 999, &s.owner, phase("10")).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let m = create(&s.pool, s.approval_id, &s.cosigner, phase("40"))
            .await
            .unwrap();
        assert_eq!(m.status, MilestoneStatus::Pending);
        assert_eq!(m.amount, Amount::units(40));
    }

    #[tokio::test]
    async fn rejection_returns_milestone_to_pending() {
        let s = setup().await;
        let m = create(&s.pool, s.approval_id, &s.owner, phase("40")).await.unwrap();

        let err = verify(
            &s.pool,
            m.id,
            &s.cosigner,
            review(VerificationDecision::Approved, ""),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let completed = complete(&s.pool, m.id, &s.owner, proof()).await.unwrap();
        assert_eq!(completed.status, MilestoneStatus::Completed);
        assert!(completed.completion_date.is_some());
        assert_eq!(completed.verification_proof.as_deref(), Some("ipfs://receipt"));

        let rejected = verify(
            &s.pool,
            m.id,
            &s.cosigner,
            review(VerificationDecision::Rejected, "receipt unreadable"),
        )
        .await
        .unwrap();
        assert_eq!(rejected.milestone.status, MilestoneStatus::Pending);
        assert_eq!(rejected.verification.status, VerificationDecision::Rejected);
        assert_eq!(rejected.verification.comments, "receipt unreadable");

        let err = release(&s.pool, m.id, &s.owner).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn only_owner_completes_and_only_cosigner_verifies() {
        let s = setup().await;
        let m = create(&s.pool, s.approval_id, &s.owner, phase("40")).await.unwrap();

        let err = complete(&s.pool, m.id, &s.cosigner, proof()).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");

        complete(&s.pool, m.id, &s.owner, proof()).await.unwrap();
        for outsider in [&s.owner, &s.email_cosigner] {
            let err = verify(
                &s.pool,
                m.id,
                outsider,
                review(VerificationDecision::Approved, ""),
            )
            .await
            .unwrap_err();
            assert_eq!(err.kind(), "forbidden");
        }

        let err = verify(&s.pool, m.id, &s.cosigner, Review::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn verified_milestone_releases_once() {
        let s = setup().await;
        let m = create(&s.pool, s.approval_id, &s.owner, phase("40")).await.unwrap();
        complete(&s.pool, m.id, &s.owner, proof()).await.unwrap();
        verify(
            &s.pool,
            m.id,
            &s.cosigner,
            review(VerificationDecision::Approved, "looks good"),
        )
        .await
        .unwrap();

        let err = complete(&s.pool, m.id, &s.owner, proof()).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let err = release(&s.pool, m.id, &s.cosigner).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");

        let released = release(&s.pool, m.id, &s.owner).await.unwrap();
        assert_eq!(released.tx_hash, format!("milestone-tx-{}", m.id));
        assert_eq!(released.milestone.status, MilestoneStatus::Released);

        let err = release(&s.pool, m.id, &s.owner).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let all = list(&s.pool, s.approval_id, &s.cosigner).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].tx_hash, Some(format!("milestone-tx-{}", m.id)));
    }

    #[tokio::test]
    async fn refund_after_partial_release_returns_remainder() {
        let s = setup().await;
        approvals::add_signature(&s.pool, s.approval_id, &s.owner, Default::default())
            .await
            .unwrap();
        approvals::execute(&s.pool, s.approval_id, &s.owner).await.unwrap();

        let m = create(&s.pool, s.approval_id, &s.owner, phase("40")).await.unwrap();
        complete(&s.pool, m.id, &s.owner, proof()).await.unwrap();
        verify(
            &s.pool,
            m.id,
            &s.cosigner,
            review(VerificationDecision::Approved, ""),
        )
        .await
        .unwrap();
        release(&s.pool, m.id, &s.owner).await.unwrap();

        let refund = approvals::refund(&s.pool, s.approval_id, &s.owner).await.unwrap();
        assert_eq!(refund.refund_amount, Amount::units(60));
    }
}
