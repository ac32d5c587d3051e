//! Charity ownership, cosigners and signing policy.

use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use cleargive_protocol::{
    AuthenticatedCaller, BudgetCategory, Charity, CharityAccess, Cosigner, Role,
};

use crate::db;
use crate::errors::{AppError, Result};
use crate::events::{self, EventKind, WorkflowEvent};
use crate::ledger;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NewCharity {
    pub name: String,
    pub description: String,
    pub category: String,
}

/// A charity with its active cosigners and budget.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharityDetails {
    #[serde(flatten)]
    pub charity: Charity,
    pub cosigners: Vec<Cosigner>,
    pub budget_categories: Vec<BudgetCategory>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewCosigner {
    pub user_id: Option<i64>,
    pub email: String,
    pub is_primary: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnershipTransfer {
    pub new_owner_id: i64,
    /// Must match the new owner's registered email.
    pub email: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MultiSigSettings {
    pub is_multi_sig: bool,
    pub required_signatures: i64,
}

/// Owner and active cosigners of a charity; `NotFound` if it does not exist.
pub async fn load_access(conn: &mut SqliteConnection, charity_id: i64) -> Result<CharityAccess> {
    let charity = db::fetch_charity(&mut *conn, charity_id)
        .await?
        .ok_or_else(|| AppError::not_found("Charity not found"))?;
    let cosigners = db::fetch_active_cosigners(&mut *conn, charity_id).await?;
    Ok(CharityAccess {
        charity_id,
        owner_id: charity.owner_id,
        cosigners,
    })
}

/// Register a charity owned by the caller, with a single-signature policy.
/// Only `CHARITY_OWNER` accounts may do this.
pub async fn create_charity(
    pool: &SqlitePool,
    caller: &AuthenticatedCaller,
    input: NewCharity,
) -> Result<Charity> {
    caller.require_role(Role::CharityOwner, "Only charity owners can create charities")?;
    let name = input.name.trim();
    if name.is_empty() {
        return Err(AppError::validation("Charity name is required"));
    }
    let charity = db::insert_charity(
        pool,
        caller.id,
        name,
        input.description.trim(),
        input.category.trim(),
    )
    .await?;
    info!(charity_id = charity.id, owner = caller.id, "charity created");
    Ok(charity)
}

pub async fn details(pool: &SqlitePool, charity_id: i64) -> Result<CharityDetails> {
    let mut conn = pool.acquire().await?;
    let charity = db::fetch_charity(&mut conn, charity_id)
        .await?
        .ok_or_else(|| AppError::not_found("Charity not found"))?;
    let cosigners = db::fetch_active_cosigners(&mut conn, charity_id).await?;
    let budget_categories = ledger::categories(&mut conn, charity_id).await?;
    Ok(CharityDetails {
        charity,
        cosigners,
        budget_categories,
    })
}

pub async fn add_cosigner(
    pool: &SqlitePool,
    charity_id: i64,
    caller: &AuthenticatedCaller,
    input: NewCosigner,
) -> Result<Cosigner> {
    let mut tx = pool.begin().await?;
    if !db::lock_charity(&mut tx, charity_id).await? {
        return Err(AppError::not_found("Charity not found"));
    }
    let access = load_access(&mut tx, charity_id).await?;
    access.require_owner(caller, "add cosigners")?;

    let email = input.email.trim();
    if email.is_empty() {
        return Err(AppError::validation("Email is required"));
    }

    let created_at = db::now();
    let id = sqlx::query(
        r#"
        INSERT INTO cosigners (charity_id, user_id, email, is_primary, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(charity_id)
    .bind(input.user_id)
    .bind(email)
    .bind(input.is_primary)
    .bind(created_at)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    events::record(
        &mut tx,
        &WorkflowEvent::new(EventKind::CosignerAdded, charity_id, id, caller.id).with_detail(email),
    )
    .await?;
    tx.commit().await?;

    info!(charity_id, cosigner_id = id, caller = caller.id, "cosigner added");
    Ok(Cosigner {
        id,
        charity_id,
        user_id: input.user_id,
        email: email.to_string(),
        is_primary: input.is_primary,
        created_at,
    })
}

/// Soft-delete a cosigner. Removed cosigners stop authorizing immediately.
pub async fn remove_cosigner(
    pool: &SqlitePool,
    charity_id: i64,
    caller: &AuthenticatedCaller,
    cosigner_id: i64,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    if !db::lock_charity(&mut tx, charity_id).await? {
        return Err(AppError::not_found("Charity not found"));
    }
    let access = load_access(&mut tx, charity_id).await?;
    access.require_owner(caller, "remove cosigners")?;

    let removed = sqlx::query(
        r#"
        UPDATE cosigners
        SET    removed_at = ?1
        WHERE  id = ?2 AND charity_id = ?3 AND removed_at IS NULL
        "#,
    )
    .bind(db::now())
    .bind(cosigner_id)
    .bind(charity_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if removed == 0 {
        return Err(AppError::not_found("Cosigner not found"));
    }

    events::record(
        &mut tx,
        &WorkflowEvent::new(EventKind::CosignerRemoved, charity_id, cosigner_id, caller.id),
    )
    .await?;
    tx.commit().await?;

    info!(charity_id, cosigner_id, caller = caller.id, "cosigner removed");
    Ok(())
}

/// Hand the charity to another registered user, promoting their account
/// to `CHARITY_OWNER` in the same transaction.
pub async fn transfer_ownership(
    pool: &SqlitePool,
    charity_id: i64,
    caller: &AuthenticatedCaller,
    input: OwnershipTransfer,
) -> Result<Charity> {
    let mut tx = pool.begin().await?;
    if !db::lock_charity(&mut tx, charity_id).await? {
        return Err(AppError::not_found("Charity not found"));
    }
    let access = load_access(&mut tx, charity_id).await?;
    access.require_owner(caller, "transfer ownership")?;

    let email = input.email.trim();
    if input.new_owner_id <= 0 || email.is_empty() {
        return Err(AppError::validation("New owner ID and email are required"));
    }
    let new_owner = db::fetch_user(&mut tx, input.new_owner_id)
        .await?
        .ok_or_else(|| AppError::not_found("New owner not found"))?;
    if new_owner.email != email {
        return Err(AppError::validation("Email does not match the user"));
    }

    let now = db::now();
    sqlx::query("UPDATE charities SET owner_id = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(new_owner.id)
        .bind(now)
        .bind(charity_id)
        .execute(&mut *tx)
        .await?;
    if new_owner.role != Role::CharityOwner {
        sqlx::query("UPDATE users SET role = ?1 WHERE id = ?2")
            .bind(Role::CharityOwner.as_str())
            .bind(new_owner.id)
            .execute(&mut *tx)
            .await?;
    }

    events::record(
        &mut tx,
        &WorkflowEvent::new(EventKind::OwnershipTransferred, charity_id, charity_id, caller.id)
            .with_detail(format!("from={} to={}", access.owner_id, new_owner.id)),
    )
    .await?;
    let charity = db::fetch_charity(&mut tx, charity_id)
        .await?
        .ok_or_else(|| AppError::not_found("Charity not found"))?;
    tx.commit().await?;

    info!(charity_id, from = access.owner_id, to = new_owner.id, "charity ownership transferred");
    Ok(charity)
}

/// Change the quorum policy. Open approvals keep the quorum they were created with.
pub async fn update_multisig(
    pool: &SqlitePool,
    charity_id: i64,
    caller: &AuthenticatedCaller,
    settings: MultiSigSettings,
) -> Result<Charity> {
    let mut tx = pool.begin().await?;
    if !db::lock_charity(&mut tx, charity_id).await? {
        return Err(AppError::not_found("Charity not found"));
    }
    let access = load_access(&mut tx, charity_id).await?;
    access.require_owner(caller, "update multi-signature settings")?;

    let required = settings.required_signatures;
    if required < 1 {
        return Err(AppError::validation("At least 1 signature is required"));
    }
    if settings.is_multi_sig && required < 2 {
        return Err(AppError::validation(
            "Multi-signature wallets require at least 2 signatures",
        ));
    }
    let required = u32::try_from(required)
        .map_err(|_| AppError::validation("requiredSignatures is too large"))?;

    sqlx::query(
        r#"
        UPDATE charities
        SET    is_multi_sig = ?1, required_signatures = ?2, updated_at = ?3
        WHERE  id = ?4
        "#,
    )
    .bind(settings.is_multi_sig)
    .bind(required)
    .bind(db::now())
    .bind(charity_id)
    .execute(&mut *tx)
    .await?;

    events::record(
        &mut tx,
        &WorkflowEvent::new(EventKind::MultisigUpdated, charity_id, charity_id, caller.id)
            .with_detail(format!(
                "isMultiSig={} requiredSignatures={required}",
                settings.is_multi_sig
            )),
    )
    .await?;

    let charity = db::fetch_charity(&mut tx, charity_id)
        .await?
        .ok_or_else(|| AppError::not_found("Charity not found"))?;
    tx.commit().await?;

    info!(charity_id, required, multi_sig = settings.is_multi_sig, "signing policy updated");
    Ok(charity)
}
