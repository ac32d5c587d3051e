//! Approval workflow: create, collect signatures, execute, refund.
//!
//! Every transition runs in one transaction that first takes the approval's
//! write lock, re-reads the row, asks the protocol state machine for the next
//! status and then applies a compare-and-set update. A writer that lost a race
//! sees the state the winner committed and gets `Conflict`.

use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use cleargive_protocol::{
    calculate_refund, execution_reference, Amount, ApprovalStatus, AuthenticatedCaller,
    CosignerLookup, MilestoneStatus, SignatureTally, TransactionApproval,
};

use crate::db;
use crate::errors::{conflict_on_unique, AppError, Result};
use crate::events::{self, EventKind, WorkflowEvent};
use crate::ledger;
use crate::registry;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewApproval {
    /// Decimal string, e.g. `"250.50"`.
    pub amount: String,
    pub description: String,
    pub category: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NewSignature {
    /// Opaque; stored as given.
    pub signature: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Refund {
    pub approval: TransactionApproval,
    pub refund_amount: Amount,
}

async fn lock_and_fetch(conn: &mut SqliteConnection, approval_id: i64) -> Result<TransactionApproval> {
    if !db::lock_approval(&mut *conn, approval_id).await? {
        return Err(AppError::not_found("Transaction approval not found"));
    }
    db::fetch_approval(conn, approval_id)
        .await?
        .ok_or_else(|| AppError::not_found("Transaction approval not found"))
}

/// Open a new approval with the charity's current quorum as its snapshot.
pub async fn create(
    pool: &SqlitePool,
    charity_id: i64,
    caller: &AuthenticatedCaller,
    input: NewApproval,
) -> Result<TransactionApproval> {
    let mut tx = pool.begin().await?;
    if !db::lock_charity(&mut tx, charity_id).await? {
        return Err(AppError::not_found("Charity not found"));
    }
    let access = registry::load_access(&mut tx, charity_id).await?;
    access.require_member(caller, CosignerLookup::Email, "create transactions")?;

    if input.amount.trim().is_empty() || input.description.trim().is_empty() {
        return Err(AppError::validation("Amount and description are required"));
    }
    let amount: Amount = input.amount.parse()?;
    if amount.is_zero() {
        return Err(AppError::validation("Amount must be greater than zero"));
    }

    let charity = db::fetch_charity(&mut tx, charity_id)
        .await?
        .ok_or_else(|| AppError::not_found("Charity not found"))?;
    let required = charity.required_signatures;
    let description = input.description.trim().to_string();
    let category = input.category.trim().to_string();

    let now = db::now();
    let id = sqlx::query(
        r#"
        INSERT INTO transaction_approvals
            (charity_id, amount, description, category, requested_by_id,
             required_signatures, current_signatures, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?8)
        "#,
    )
    .bind(charity_id)
    .bind(amount.stroops())
    .bind(&description)
    .bind(&category)
    .bind(caller.id)
    .bind(required)
    .bind(ApprovalStatus::Pending.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    events::record(
        &mut tx,
        &WorkflowEvent::new(EventKind::ApprovalCreated, charity_id, id, caller.id)
            .with_amount(amount),
    )
    .await?;
    tx.commit().await?;

    info!(charity_id, approval_id = id, caller = caller.id, %amount, required, "approval created");
    Ok(TransactionApproval {
        id,
        charity_id,
        amount,
        description,
        category,
        requested_by_id: caller.id,
        required_signatures: required,
        current_signatures: 0,
        status: ApprovalStatus::Pending,
        tx_hash: None,
        refund_amount: None,
        created_at: now,
        updated_at: now,
    })
}

/// Record one signer's signature; the one that meets the quorum flips the
/// approval to `Approved` in the same transaction.
pub async fn add_signature(
    pool: &SqlitePool,
    approval_id: i64,
    caller: &AuthenticatedCaller,
    input: NewSignature,
) -> Result<TransactionApproval> {
    let mut tx = pool.begin().await?;
    let mut approval = lock_and_fetch(&mut tx, approval_id).await?;

    let tally = SignatureTally {
        current: approval.current_signatures,
        required: approval.required_signatures,
    };
    let (next, status) = approval.status.sign(tally)?;

    let access = registry::load_access(&mut tx, approval.charity_id).await?;
    access.require_member(caller, CosignerLookup::Either, "sign transactions")?;

    let now = db::now();
    sqlx::query(
        r#"
        INSERT INTO approval_signatures (approval_id, signer_id, signature, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(approval_id)
    .bind(caller.id)
    .bind(&input.signature)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(|e| conflict_on_unique(e, "You have already signed this transaction"))?;

    let updated = sqlx::query(
        r#"
        UPDATE transaction_approvals
        SET    current_signatures = ?1, status = ?2, updated_at = ?3
        WHERE  id = ?4 AND status = ?5 AND current_signatures = ?6
        "#,
    )
    .bind(next.current)
    .bind(status.as_str())
    .bind(now)
    .bind(approval_id)
    .bind(ApprovalStatus::Pending.as_str())
    .bind(tally.current)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(AppError::conflict("Transaction approval changed concurrently"));
    }

    events::record(
        &mut tx,
        &WorkflowEvent::new(EventKind::SignatureAdded, approval.charity_id, approval_id, caller.id)
            .with_detail(format!("{}/{}", next.current, next.required)),
    )
    .await?;
    if status == ApprovalStatus::Approved {
        events::record(
            &mut tx,
            &WorkflowEvent::new(
                EventKind::ApprovalApproved,
                approval.charity_id,
                approval_id,
                caller.id,
            )
            .with_amount(approval.amount),
        )
        .await?;
    }
    tx.commit().await?;

    info!(
        approval_id,
        caller = caller.id,
        signatures = next.current,
        required = next.required,
        status = %status,
        "signature added"
    );
    approval.current_signatures = next.current;
    approval.status = status;
    approval.updated_at = now;
    Ok(approval)
}

/// Mark an approved request executed and debit the matching budget category.
pub async fn execute(
    pool: &SqlitePool,
    approval_id: i64,
    caller: &AuthenticatedCaller,
) -> Result<TransactionApproval> {
    let mut tx = pool.begin().await?;
    let mut approval = lock_and_fetch(&mut tx, approval_id).await?;
    let status = approval.status.execute()?;

    let access = registry::load_access(&mut tx, approval.charity_id).await?;
    access.require_owner(caller, "execute transactions")?;

    let reference = execution_reference(approval_id);
    let now = db::now();
    let updated = sqlx::query(
        r#"
        UPDATE transaction_approvals
        SET    status = ?1, tx_hash = ?2, updated_at = ?3
        WHERE  id = ?4 AND status = ?5
        "#,
    )
    .bind(status.as_str())
    .bind(&reference)
    .bind(now)
    .bind(approval_id)
    .bind(approval.status.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(AppError::conflict("Transaction approval changed concurrently"));
    }

    let debited = if approval.category.is_empty() {
        false
    } else {
        ledger::record_spend(&mut tx, approval.charity_id, &approval.category, approval.amount)
            .await?
    };
    if !debited {
        debug!(approval_id, category = %approval.category, "executed without a ledger entry");
    }

    events::record(
        &mut tx,
        &WorkflowEvent::new(EventKind::ApprovalExecuted, approval.charity_id, approval_id, caller.id)
            .with_amount(approval.amount)
            .with_detail(reference.clone()),
    )
    .await?;
    tx.commit().await?;

    info!(approval_id, caller = caller.id, tx_hash = %reference, "approval executed");
    approval.status = status;
    approval.tx_hash = Some(reference);
    approval.updated_at = now;
    Ok(approval)
}

/// Close an executed approval, returning what released milestones left over.
pub async fn refund(
    pool: &SqlitePool,
    approval_id: i64,
    caller: &AuthenticatedCaller,
) -> Result<Refund> {
    let mut tx = pool.begin().await?;
    let mut approval = lock_and_fetch(&mut tx, approval_id).await?;
    let status = approval.status.refund()?;

    let access = registry::load_access(&mut tx, approval.charity_id).await?;
    access.require_owner(caller, "initiate refunds")?;

    let released =
        db::milestone_total(&mut tx, approval_id, MilestoneStatus::Released.as_str()).await?;
    let refund_amount = calculate_refund(approval.amount, released)?;

    let now = db::now();
    let updated = sqlx::query(
        r#"
        UPDATE transaction_approvals
        SET    status = ?1, refund_amount = ?2, updated_at = ?3
        WHERE  id = ?4 AND status = ?5
        "#,
    )
    .bind(status.as_str())
    .bind(refund_amount.stroops())
    .bind(now)
    .bind(approval_id)
    .bind(approval.status.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(AppError::conflict("Transaction approval changed concurrently"));
    }

    events::record(
        &mut tx,
        &WorkflowEvent::new(EventKind::ApprovalRefunded, approval.charity_id, approval_id, caller.id)
            .with_amount(refund_amount),
    )
    .await?;
    tx.commit().await?;

    info!(approval_id, caller = caller.id, %released, %refund_amount, "approval refunded");
    approval.status = status;
    approval.refund_amount = Some(refund_amount);
    approval.updated_at = now;
    Ok(Refund {
        approval,
        refund_amount,
    })
}

/// Approvals still collecting signatures, oldest first.
pub async fn list_pending(
    pool: &SqlitePool,
    charity_id: i64,
    caller: &AuthenticatedCaller,
) -> Result<Vec<TransactionApproval>> {
    let mut conn = pool.acquire().await?;
    let access = registry::load_access(&mut conn, charity_id).await?;
    access.require_member(caller, CosignerLookup::Email, "view transactions")?;
    db::fetch_approvals_with_status(&mut conn, charity_id, ApprovalStatus::Pending.as_str()).await
}
