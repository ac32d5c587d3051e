//! Budget ledger: per-category allocation and running spend.
//!
//! `spent` only moves when an approval is executed, through [`record_spend`]
//! on the executing transaction. Category maintenance never touches it.

use serde::Deserialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use cleargive_protocol::{Amount, AuthenticatedCaller, BudgetCategory};

use crate::db::{self, decode_err};
use crate::errors::{AppError, Result};
use crate::events::{self, EventKind, WorkflowEvent};
use crate::registry;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CategoryInput {
    pub name: String,
    /// Percentage of the charity's total budget.
    pub allocation: f64,
}

impl CategoryInput {
    fn validated(&self) -> Result<&str> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(AppError::validation("Category name is required"));
        }
        if !self.allocation.is_finite() || !(0.0..=100.0).contains(&self.allocation) {
            return Err(AppError::validation(
                "Allocation must be a percentage between 0 and 100",
            ));
        }
        Ok(name)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CategoryRow {
    id: i64,
    charity_id: i64,
    name: String,
    allocation: f64,
    spent: i64,
}

impl TryFrom<CategoryRow> for BudgetCategory {
    type Error = AppError;

    fn try_from(row: CategoryRow) -> Result<Self> {
        Ok(BudgetCategory {
            id: row.id,
            charity_id: row.charity_id,
            name: row.name,
            allocation: row.allocation,
            spent: Amount::from_stroops(row.spent).map_err(decode_err)?,
        })
    }
}

pub async fn categories(conn: &mut SqliteConnection, charity_id: i64) -> Result<Vec<BudgetCategory>> {
    sqlx::query_as::<_, CategoryRow>(
        r#"
        SELECT id, charity_id, name, allocation, spent
        FROM   budget_categories
        WHERE  charity_id = ?1 AND removed_at IS NULL
        ORDER  BY id ASC
        "#,
    )
    .bind(charity_id)
    .fetch_all(conn)
    .await?
    .into_iter()
    .map(BudgetCategory::try_from)
    .collect()
}

async fn fetch_category(
    conn: &mut SqliteConnection,
    charity_id: i64,
    category_id: i64,
) -> Result<Option<BudgetCategory>> {
    sqlx::query_as::<_, CategoryRow>(
        r#"
        SELECT id, charity_id, name, allocation, spent
        FROM   budget_categories
        WHERE  id = ?1 AND charity_id = ?2 AND removed_at IS NULL
        "#,
    )
    .bind(category_id)
    .bind(charity_id)
    .fetch_optional(conn)
    .await?
    .map(BudgetCategory::try_from)
    .transpose()
}

pub async fn add_category(
    pool: &SqlitePool,
    charity_id: i64,
    caller: &AuthenticatedCaller,
    input: CategoryInput,
) -> Result<BudgetCategory> {
    let mut tx = pool.begin().await?;
    if !db::lock_charity(&mut tx, charity_id).await? {
        return Err(AppError::not_found("Charity not found"));
    }
    let access = registry::load_access(&mut tx, charity_id).await?;
    access.require_owner(caller, "manage budget categories")?;
    let name = input.validated()?;

    let now = db::now();
    let id = sqlx::query(
        r#"
        INSERT INTO budget_categories (charity_id, name, allocation, spent, created_at, updated_at)
        VALUES (?1, ?2, ?3, 0, ?4, ?4)
        "#,
    )
    .bind(charity_id)
    .bind(name)
    .bind(input.allocation)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    events::record(
        &mut tx,
        &WorkflowEvent::new(EventKind::BudgetCategoryAdded, charity_id, id, caller.id)
            .with_detail(name),
    )
    .await?;
    tx.commit().await?;

    info!(charity_id, category_id = id, "budget category added");
    Ok(BudgetCategory {
        id,
        charity_id,
        name: name.to_string(),
        allocation: input.allocation,
        spent: Amount::ZERO,
    })
}

/// Rename or re-allocate a category. `spent` is left as it is.
pub async fn update_category(
    pool: &SqlitePool,
    charity_id: i64,
    category_id: i64,
    caller: &AuthenticatedCaller,
    input: CategoryInput,
) -> Result<BudgetCategory> {
    let mut tx = pool.begin().await?;
    if !db::lock_charity(&mut tx, charity_id).await? {
        return Err(AppError::not_found("Charity not found"));
    }
    let access = registry::load_access(&mut tx, charity_id).await?;
    access.require_owner(caller, "manage budget categories")?;
    let name = input.validated()?;

    let updated = sqlx::query(
        r#"
        UPDATE budget_categories
        SET    name = ?1, allocation = ?2, updated_at = ?3
        WHERE  id = ?4 AND charity_id = ?5 AND removed_at IS NULL
        "#,
    )
    .bind(name)
    .bind(input.allocation)
    .bind(db::now())
    .bind(category_id)
    .bind(charity_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(AppError::not_found("Budget category not found"));
    }

    events::record(
        &mut tx,
        &WorkflowEvent::new(EventKind::BudgetCategoryUpdated, charity_id, category_id, caller.id)
            .with_detail(name),
    )
    .await?;
    let category = fetch_category(&mut tx, charity_id, category_id)
        .await?
        .ok_or_else(|| AppError::not_found("Budget category not found"))?;
    tx.commit().await?;

    info!(charity_id, category_id, "budget category updated");
    Ok(category)
}

/// Soft-delete a category. Its past spend stays in the table but it no
/// longer appears in the budget or receives spend.
pub async fn remove_category(
    pool: &SqlitePool,
    charity_id: i64,
    category_id: i64,
    caller: &AuthenticatedCaller,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    if !db::lock_charity(&mut tx, charity_id).await? {
        return Err(AppError::not_found("Charity not found"));
    }
    let access = registry::load_access(&mut tx, charity_id).await?;
    access.require_owner(caller, "delete budget categories")?;

    let removed = sqlx::query(
        r#"
        UPDATE budget_categories
        SET    removed_at = ?1, updated_at = ?1
        WHERE  id = ?2 AND charity_id = ?3 AND removed_at IS NULL
        "#,
    )
    .bind(db::now())
    .bind(category_id)
    .bind(charity_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if removed == 0 {
        return Err(AppError::not_found("Budget category not found"));
    }

    events::record(
        &mut tx,
        &WorkflowEvent::new(EventKind::BudgetCategoryRemoved, charity_id, category_id, caller.id),
    )
    .await?;
    tx.commit().await?;

    info!(charity_id, category_id, "budget category removed");
    Ok(())
}

/// Add `amount` to the first active category of the charity named `name`.
///
/// Runs on the caller's transaction, which must already hold the write
/// lock. Returns `false` when no category matches; the caller decides
/// whether that matters.
pub async fn record_spend(
    conn: &mut SqliteConnection,
    charity_id: i64,
    name: &str,
    amount: Amount,
) -> Result<bool> {
    let target: Option<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT id, spent
        FROM   budget_categories
        WHERE  charity_id = ?1 AND name = ?2 AND removed_at IS NULL
        ORDER  BY id ASC
        LIMIT  1
        "#,
    )
    .bind(charity_id)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((category_id, spent)) = target else {
        debug!(charity_id, category = name, "no budget category matched; ledger untouched");
        return Ok(false);
    };
    let spent = Amount::from_stroops(spent)
        .map_err(decode_err)?
        .checked_add(amount)
        .ok_or_else(|| AppError::validation("amount total overflows"))?;

    sqlx::query("UPDATE budget_categories SET spent = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(spent.stroops())
        .bind(db::now())
        .bind(category_id)
        .execute(&mut *conn)
        .await?;

    warn_if_over_allocation(conn, charity_id, name).await?;
    Ok(true)
}

/// Soft check: a category whose share of total spend exceeds its allocation.
async fn warn_if_over_allocation(
    conn: &mut SqliteConnection,
    charity_id: i64,
    name: &str,
) -> Result<()> {
    let all = categories(conn, charity_id).await?;
    let total: i128 = all.iter().map(|c| i128::from(c.spent.stroops())).sum();
    if total == 0 {
        return Ok(());
    }
    if let Some(category) = all.iter().find(|c| c.name == name) {
        let share = category.spent.stroops() as f64 * 100.0 / total as f64;
        if share > category.allocation {
            warn!(
                charity_id,
                category = name,
                share,
                allocation = category.allocation,
                "category spend exceeds its allocation"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures;

    fn input(name: &str, allocation: f64) -> CategoryInput {
        CategoryInput {
            name: name.to_string(),
            allocation,
        }
    }

    #[tokio::test]
    async fn category_maintenance_checks_owner_and_input() {
        let pool = db::test_pool().await;
        let owner = fixtures::user(&pool, "owner").await;
        let stranger = fixtures::user(&pool, "stranger").await;
        let charity = fixtures::charity(&pool, &owner).await;

        let err = add_category(&pool, charity.id, &stranger, input("wells", 50.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "forbidden");

        for bad in [input("", 10.0), input("wells", 101.0), input("wells", -1.0)] {
            let err = add_category(&pool, charity.id, &owner, bad).await.unwrap_err();
            assert_eq!(err.kind(), "validation_error");
        }

        let added = add_category(&pool, charity.id, &owner, input("wells", 60.0))
            .await
            .unwrap();
        assert_eq!(added.spent, Amount::ZERO);

        let err = update_category(&pool, charity.id, 999, &owner, input("pumps", 10.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn spend_goes_to_first_matching_category_and_survives_renames() {
        let pool = db::test_pool().await;
        let owner = fixtures::user(&pool, "owner").await;
        let charity = fixtures::charity(&pool, &owner).await;
        let first = add_category(&pool, charity.id, &owner, input("wells", 60.0))
            .await
            .unwrap();
        let second = add_category(&pool, charity.id, &owner, input("wells", 40.0))
            .await
            .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert!(record_spend(&mut conn, charity.id, "wells", Amount::units(25))
            .await
            .unwrap());
        assert!(!record_spend(&mut conn, charity.id, "roads", Amount::units(5))
            .await
            .unwrap());
        drop(conn);

        let updated = update_category(&pool, charity.id, first.id, &owner, input("boreholes", 70.0))
            .await
            .unwrap();
        assert_eq!(updated.name, "boreholes");
        assert_eq!(updated.spent, Amount::units(25));

        let mut conn = pool.acquire().await.unwrap();
        let all = categories(&mut conn, charity.id).await.unwrap();
        let untouched = all.iter().find(|c| c.id == second.id).unwrap();
        assert_eq!(untouched.spent, Amount::ZERO);
    }

    #[tokio::test]
    async fn removed_category_leaves_budget_and_takes_no_spend() {
        let pool = db::test_pool().await;
        let owner = fixtures::user(&pool, "owner").await;
        let stranger = fixtures::user(&pool, "stranger").await;
        let charity = fixtures::charity(&pool, &owner).await;
        let wells = add_category(&pool, charity.id, &owner, input("wells", 60.0))
            .await
            .unwrap();

        let err = remove_category(&pool, charity.id, wells.id, &stranger)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "forbidden");

        remove_category(&pool, charity.id, wells.id, &owner).await.unwrap();
        let err = remove_category(&pool, charity.id, wells.id, &owner)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        let err = update_category(&pool, charity.id, wells.id, &owner, input("pumps", 10.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let mut conn = pool.acquire().await.unwrap();
        assert!(categories(&mut conn, charity.id).await.unwrap().is_empty());
        assert!(!record_spend(&mut conn, charity.id, "wells", Amount::units(5))
            .await
            .unwrap());
        drop(conn);

        let events = events::list_for_charity(&pool, charity.id).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, "budget_category_removed");
    }

    #[tokio::test]
    async fn overflowing_spend_is_rejected_and_leaves_ledger_alone() {
        let pool = db::test_pool().await;
        let owner = fixtures::user(&pool, "owner").await;
        let charity = fixtures::charity(&pool, &owner).await;
        add_category(&pool, charity.id, &owner, input("wells", 100.0))
            .await
            .unwrap();

        let ceiling = Amount::from_stroops(i64::MAX).unwrap();
        let mut conn = pool.acquire().await.unwrap();
        assert!(record_spend(&mut conn, charity.id, "wells", ceiling)
            .await
            .unwrap());
        let err = record_spend(&mut conn, charity.id, "wells", Amount::units(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let all = categories(&mut conn, charity.id).await.unwrap();
        assert_eq!(all[0].spent, ceiling);
    }
}
