//! Workflow event log.
//!
//! Every successful state-changing step appends one row in the same
//! transaction as the change itself, so the log never disagrees with the
//! records it describes.

use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};

use cleargive_protocol::{Amount, AuthenticatedCaller, CosignerLookup};

use crate::db;
use crate::errors::Result;
use crate::registry;

/// All recognised workflow event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Multi-signature flag or quorum changed.
    MultisigUpdated,
    OwnershipTransferred,
    CosignerAdded,
    CosignerRemoved,
    BudgetCategoryAdded,
    BudgetCategoryUpdated,
    BudgetCategoryRemoved,
    ApprovalCreated,
    SignatureAdded,
    /// The signature that met the quorum.
    ApprovalApproved,
    ApprovalExecuted,
    ApprovalRefunded,
    MilestoneCreated,
    MilestoneCompleted,
    MilestoneVerified,
    /// A cosigner rejected the proof; the milestone went back to pending.
    MilestoneRejected,
    MilestoneReleased,
}

impl EventKind {
    /// Return a short identifier string suitable for storage in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultisigUpdated => "multisig_updated",
            Self::OwnershipTransferred => "ownership_transferred",
            Self::CosignerAdded => "cosigner_added",
            Self::CosignerRemoved => "cosigner_removed",
            Self::BudgetCategoryAdded => "budget_category_added",
            Self::BudgetCategoryUpdated => "budget_category_updated",
            Self::BudgetCategoryRemoved => "budget_category_removed",
            Self::ApprovalCreated => "approval_created",
            Self::SignatureAdded => "signature_added",
            Self::ApprovalApproved => "approval_approved",
            Self::ApprovalExecuted => "approval_executed",
            Self::ApprovalRefunded => "approval_refunded",
            Self::MilestoneCreated => "milestone_created",
            Self::MilestoneCompleted => "milestone_completed",
            Self::MilestoneVerified => "milestone_verified",
            Self::MilestoneRejected => "milestone_rejected",
            Self::MilestoneReleased => "milestone_released",
        }
    }
}

/// An event ready to be stored.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub kind: EventKind,
    pub charity_id: i64,
    /// Id of the record the event is about (approval, milestone, cosigner...).
    pub subject_id: i64,
    pub actor_id: i64,
    pub amount: Option<Amount>,
    pub detail: Option<String>,
}

impl WorkflowEvent {
    pub fn new(kind: EventKind, charity_id: i64, subject_id: i64, actor_id: i64) -> Self {
        Self {
            kind,
            charity_id,
            subject_id,
            actor_id,
            amount: None,
            detail: None,
        }
    }

    pub fn with_amount(mut self, amount: Amount) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// An event record as read back from the database.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: i64,
    pub charity_id: i64,
    pub event_type: String,
    pub subject_id: i64,
    pub actor_id: i64,
    /// Stroops.
    pub amount: Option<i64>,
    pub detail: Option<String>,
    pub created_at: i64,
}

/// Append one event. Call it on the transaction that made the change.
pub async fn record(conn: &mut SqliteConnection, event: &WorkflowEvent) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO workflow_events
            (charity_id, event_type, subject_id, actor_id, amount, detail, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(event.charity_id)
    .bind(event.kind.as_str())
    .bind(event.subject_id)
    .bind(event.actor_id)
    .bind(event.amount.map(Amount::stroops))
    .bind(event.detail.as_deref())
    .bind(db::now())
    .execute(conn)
    .await?;
    Ok(())
}

/// All events for a charity, oldest first.
pub async fn list_for_charity(pool: &SqlitePool, charity_id: i64) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, charity_id, event_type, subject_id, actor_id, amount, detail, created_at
        FROM   workflow_events
        WHERE  charity_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(charity_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// The event log of a charity, readable by its owner and cosigners.
pub async fn history(
    pool: &SqlitePool,
    charity_id: i64,
    caller: &AuthenticatedCaller,
) -> Result<Vec<EventRecord>> {
    let mut conn = pool.acquire().await?;
    let access = registry::load_access(&mut conn, charity_id).await?;
    access.require_member(caller, CosignerLookup::Either, "view the event log")?;
    drop(conn);
    list_for_charity(pool, charity_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorded_events_come_back_in_order() {
        let pool = db::test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        record(
            &mut conn,
            &WorkflowEvent::new(EventKind::ApprovalCreated, 1, 10, 3).with_amount(Amount::units(5)),
        )
        .await
        .unwrap();
        record(
            &mut conn,
            &WorkflowEvent::new(EventKind::ApprovalRefunded, 1, 10, 3).with_detail("remainder"),
        )
        .await
        .unwrap();
        record(&mut conn, &WorkflowEvent::new(EventKind::CosignerAdded, 2, 1, 3))
            .await
            .unwrap();
        drop(conn);

        let events = list_for_charity(&pool, 1).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "approval_created");
        assert_eq!(events[0].amount, Some(50_000_000));
        assert_eq!(events[1].event_type, "approval_refunded");
        assert_eq!(events[1].detail.as_deref(), Some("remainder"));
    }
}
