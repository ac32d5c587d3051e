//! Database layer: migrations, row mapping, row locks and shared lookups.
//!
//! Workflow modules run their own transactions; the helpers here take a
//! `&mut SqliteConnection` so they work the same on a pooled connection or
//! inside a transaction (`&mut *tx`).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cleargive_protocol::{
    Amount, AuthenticatedCaller, Charity, Cosigner, Milestone, Role, TransactionApproval,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::errors::{conflict_on_unique, AppError, Result};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Make sure the file is created if it doesn't exist yet.
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Fresh in-memory database with the schema applied.
///
/// One connection only: every connection to `sqlite::memory:` is its own
/// database, and the pool must never recycle it.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

pub fn now() -> i64 {
    Utc::now().timestamp()
}

pub(crate) fn decode_err(e: impl std::error::Error + Send + Sync + 'static) -> AppError {
    AppError::Database(sqlx::Error::Decode(Box::new(e)))
}

fn amount(stroops: i64) -> Result<Amount> {
    Amount::from_stroops(stroops).map_err(decode_err)
}

fn count(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(decode_err)
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

// ─────────────────────────────────────────────────────────
// Row locks
// ─────────────────────────────────────────────────────────
//
// SQLite has no `SELECT … FOR UPDATE`. Touching the row as the first
// statement of a transaction takes the database write lock, so every other
// writer waits until commit and then reads the state this one left behind.

/// Take the write lock for an approval. Returns `false` when the row is absent.
pub async fn lock_approval(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    let touched = sqlx::query("UPDATE transaction_approvals SET updated_at = updated_at WHERE id = ?1")
        .bind(id)
        .execute(conn)
        .await?
        .rows_affected();
    Ok(touched == 1)
}

/// Take the write lock for a milestone. Returns `false` when the row is absent.
pub async fn lock_milestone(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    let touched = sqlx::query("UPDATE milestones SET updated_at = updated_at WHERE id = ?1")
        .bind(id)
        .execute(conn)
        .await?
        .rows_affected();
    Ok(touched == 1)
}

/// Take the write lock for a charity. Returns `false` when the row is absent.
pub async fn lock_charity(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    let touched = sqlx::query("UPDATE charities SET updated_at = updated_at WHERE id = ?1")
        .bind(id)
        .execute(conn)
        .await?
        .rows_affected();
    Ok(touched == 1)
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    role: String,
    created_at: i64,
}

/// A registered account. The credential is never echoed back.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: Role,
    pub created_at: i64,
}

impl TryFrom<UserRow> for User {
    type Error = AppError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: row.id,
            email: row.email,
            role: row.role.parse().map_err(decode_err)?,
            created_at: row.created_at,
        })
    }
}

/// Register an account under a bearer credential.
pub async fn insert_user(
    pool: &SqlitePool,
    credential: &str,
    email: &str,
    role: Role,
) -> Result<User> {
    let created_at = now();
    let id = sqlx::query(
        "INSERT INTO users (credential, email, role, created_at) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(credential)
    .bind(email)
    .bind(role.as_str())
    .bind(created_at)
    .execute(pool)
    .await
    .map_err(|e| conflict_on_unique(e, "A user with this credential already exists"))?
    .last_insert_rowid();

    Ok(User {
        id,
        email: email.to_string(),
        role,
        created_at,
    })
}

pub async fn fetch_user(conn: &mut SqliteConnection, id: i64) -> Result<Option<User>> {
    sqlx::query_as::<_, UserRow>("SELECT id, email, role, created_at FROM users WHERE id = ?1")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .map(User::try_from)
        .transpose()
}

/// Resolve a bearer credential to the caller triple.
pub async fn find_caller_by_credential(
    pool: &SqlitePool,
    credential: &str,
) -> Result<Option<AuthenticatedCaller>> {
    let row = sqlx::query_as::<_, UserRow>(
        "SELECT id, email, role, created_at FROM users WHERE credential = ?1",
    )
    .bind(credential)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        let user = User::try_from(r)?;
        Ok(AuthenticatedCaller {
            id: user.id,
            role: user.role,
            email: user.email,
        })
    })
    .transpose()
}

// ─────────────────────────────────────────────────────────
// Charities and cosigners
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
struct CharityRow {
    id: i64,
    name: String,
    description: String,
    category: String,
    owner_id: i64,
    is_multi_sig: bool,
    required_signatures: i64,
    created_at: i64,
}

impl TryFrom<CharityRow> for Charity {
    type Error = AppError;

    fn try_from(row: CharityRow) -> Result<Self> {
        Ok(Charity {
            id: row.id,
            name: row.name,
            description: row.description,
            category: row.category,
            owner_id: row.owner_id,
            is_multi_sig: row.is_multi_sig,
            required_signatures: count(row.required_signatures)?,
            created_at: row.created_at,
        })
    }
}

pub async fn insert_charity(
    pool: &SqlitePool,
    owner_id: i64,
    name: &str,
    description: &str,
    category: &str,
) -> Result<Charity> {
    let created_at = now();
    let id = sqlx::query(
        r#"
        INSERT INTO charities
            (name, description, category, owner_id, is_multi_sig, required_signatures,
             created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, 0, 1, ?5, ?5)
        "#,
    )
    .bind(name)
    .bind(description)
    .bind(category)
    .bind(owner_id)
    .bind(created_at)
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(Charity {
        id,
        name: name.to_string(),
        description: description.to_string(),
        category: category.to_string(),
        owner_id,
        is_multi_sig: false,
        required_signatures: 1,
        created_at,
    })
}

pub async fn fetch_charity(conn: &mut SqliteConnection, id: i64) -> Result<Option<Charity>> {
    sqlx::query_as::<_, CharityRow>(
        r#"
        SELECT id, name, description, category, owner_id, is_multi_sig,
               required_signatures, created_at
        FROM   charities
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?
    .map(Charity::try_from)
    .transpose()
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CosignerRow {
    id: i64,
    charity_id: i64,
    user_id: Option<i64>,
    email: String,
    is_primary: bool,
    created_at: i64,
}

impl From<CosignerRow> for Cosigner {
    fn from(row: CosignerRow) -> Self {
        Cosigner {
            id: row.id,
            charity_id: row.charity_id,
            user_id: row.user_id,
            email: row.email,
            is_primary: row.is_primary,
            created_at: row.created_at,
        }
    }
}

/// Cosigners that have not been removed, oldest first.
pub async fn fetch_active_cosigners(
    conn: &mut SqliteConnection,
    charity_id: i64,
) -> Result<Vec<Cosigner>> {
    let rows = sqlx::query_as::<_, CosignerRow>(
        r#"
        SELECT id, charity_id, user_id, email, is_primary, created_at
        FROM   cosigners
        WHERE  charity_id = ?1 AND removed_at IS NULL
        ORDER  BY id ASC
        "#,
    )
    .bind(charity_id)
    .fetch_all(conn)
    .await?;
    Ok(rows.into_iter().map(Cosigner::from).collect())
}

// ─────────────────────────────────────────────────────────
// Approvals
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
struct ApprovalRow {
    id: i64,
    charity_id: i64,
    amount: i64,
    description: String,
    category: String,
    requested_by_id: i64,
    required_signatures: i64,
    current_signatures: i64,
    status: String,
    tx_hash: Option<String>,
    refund_amount: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<ApprovalRow> for TransactionApproval {
    type Error = AppError;

    fn try_from(row: ApprovalRow) -> Result<Self> {
        Ok(TransactionApproval {
            id: row.id,
            charity_id: row.charity_id,
            amount: amount(row.amount)?,
            description: row.description,
            category: row.category,
            requested_by_id: row.requested_by_id,
            required_signatures: count(row.required_signatures)?,
            current_signatures: count(row.current_signatures)?,
            status: row.status.parse().map_err(decode_err)?,
            tx_hash: row.tx_hash,
            refund_amount: row.refund_amount.map(amount).transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const APPROVAL_COLUMNS: &str = "id, charity_id, amount, description, category, requested_by_id, \
     required_signatures, current_signatures, status, tx_hash, refund_amount, created_at, updated_at";

pub async fn fetch_approval(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<TransactionApproval>> {
    sqlx::query_as::<_, ApprovalRow>(&format!(
        "SELECT {APPROVAL_COLUMNS} FROM transaction_approvals WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?
    .map(TransactionApproval::try_from)
    .transpose()
}

pub async fn fetch_approvals_with_status(
    conn: &mut SqliteConnection,
    charity_id: i64,
    status: &str,
) -> Result<Vec<TransactionApproval>> {
    sqlx::query_as::<_, ApprovalRow>(&format!(
        "SELECT {APPROVAL_COLUMNS} FROM transaction_approvals \
         WHERE charity_id = ?1 AND status = ?2 ORDER BY id ASC"
    ))
    .bind(charity_id)
    .bind(status)
    .fetch_all(conn)
    .await?
    .into_iter()
    .map(TransactionApproval::try_from)
    .collect()
}

// ─────────────────────────────────────────────────────────
// Milestones
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
struct MilestoneRow {
    id: i64,
    approval_id: i64,
    name: String,
    description: String,
    amount: i64,
    due_date: Option<i64>,
    completion_date: Option<i64>,
    verification_proof: Option<String>,
    status: String,
    tx_hash: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<MilestoneRow> for Milestone {
    type Error = AppError;

    fn try_from(row: MilestoneRow) -> Result<Self> {
        Ok(Milestone {
            id: row.id,
            approval_id: row.approval_id,
            name: row.name,
            description: row.description,
            amount: amount(row.amount)?,
            due_date: timestamp(row.due_date),
            completion_date: timestamp(row.completion_date),
            verification_proof: row.verification_proof,
            status: row.status.parse().map_err(decode_err)?,
            tx_hash: row.tx_hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const MILESTONE_COLUMNS: &str = "id, approval_id, name, description, amount, due_date, \
     completion_date, verification_proof, status, tx_hash, created_at, updated_at";

pub async fn fetch_milestone(conn: &mut SqliteConnection, id: i64) -> Result<Option<Milestone>> {
    sqlx::query_as::<_, MilestoneRow>(&format!(
        "SELECT {MILESTONE_COLUMNS} FROM milestones WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?
    .map(Milestone::try_from)
    .transpose()
}

pub async fn fetch_milestones_for_approval(
    conn: &mut SqliteConnection,
    approval_id: i64,
) -> Result<Vec<Milestone>> {
    sqlx::query_as::<_, MilestoneRow>(&format!(
        "SELECT {MILESTONE_COLUMNS} FROM milestones WHERE approval_id = ?1 ORDER BY id ASC"
    ))
    .bind(approval_id)
    .fetch_all(conn)
    .await?
    .into_iter()
    .map(Milestone::try_from)
    .collect()
}

/// Total amount of an approval's milestones in the given status.
///
/// Summed in Rust so an overflowing total is a validation error rather
/// than a driver failure.
pub async fn milestone_total(
    conn: &mut SqliteConnection,
    approval_id: i64,
    status: &str,
) -> Result<Amount> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT amount FROM milestones WHERE approval_id = ?1 AND status = ?2")
            .bind(approval_id)
            .bind(status)
            .fetch_all(conn)
            .await?;
    let amounts = rows
        .into_iter()
        .map(|(stroops,)| amount(stroops))
        .collect::<Result<Vec<_>>>()?;
    Ok(Amount::sum(amounts)?)
}
