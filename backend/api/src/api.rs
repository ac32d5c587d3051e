//! Axum REST API handlers.
//!
//! Every response uses one envelope: `{"status":"success","data":…}` on
//! success and `{"status":"error","error":<kind>,"message":…}` on failure.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use cleargive_protocol::Role;

use crate::approvals::{self, NewApproval, NewSignature};
use crate::auth::Authenticated;
use crate::db;
use crate::errors::{AppError, Result};
use crate::events;
use crate::ledger::{self, CategoryInput};
use crate::milestones::{self, Completion, NewMilestone, Review};
use crate::registry::{self, MultiSigSettings, NewCharity, NewCosigner, OwnershipTransfer};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct Envelope<T> {
    pub status: &'static str,
    pub data: T,
}

fn success<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        status: "success",
        data,
    })
}

fn created<T: Serialize>(data: T) -> (StatusCode, Json<Envelope<T>>) {
    (StatusCode::CREATED, success(data))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Removed {
    pub cosigner_id: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedCategory {
    pub category_id: i64,
}

/// Unwrap a JSON body, reporting a malformed one inside the error envelope.
fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

/// Sign-up record from the identity collaborator. The account type is
/// chosen at sign-up and only decides who may register new charities;
/// authority over an existing charity comes from ownership and cosigner
/// membership alone.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Registration {
    pub credential: String,
    pub email: String,
    pub role: Option<Role>,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /api/users`
pub async fn register_user(
    State(state): State<Arc<ApiState>>,
    payload: std::result::Result<Json<Registration>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let input = body(payload)?;
    let credential = input.credential.trim();
    let email = input.email.trim();
    if credential.is_empty() || email.is_empty() {
        return Err(AppError::validation("Credential and email are required"));
    }
    let user = db::insert_user(
        &state.pool,
        credential,
        email,
        input.role.unwrap_or(Role::User),
    )
    .await?;
    Ok(created(user))
}

/// `POST /api/charities`
pub async fn create_charity(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    payload: std::result::Result<Json<NewCharity>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let charity = registry::create_charity(&state.pool, &caller, body(payload)?).await?;
    Ok(created(charity))
}

/// `GET /api/charities/:id`
pub async fn get_charity(
    State(state): State<Arc<ApiState>>,
    Authenticated(_caller): Authenticated,
    Path(charity_id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(success(registry::details(&state.pool, charity_id).await?))
}

/// `PATCH /api/charities/:id/multisig`
pub async fn update_multisig(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(charity_id): Path<i64>,
    payload: std::result::Result<Json<MultiSigSettings>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let charity =
        registry::update_multisig(&state.pool, charity_id, &caller, body(payload)?).await?;
    Ok(success(charity))
}

/// `POST /api/charities/:id/cosigners`
pub async fn add_cosigner(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(charity_id): Path<i64>,
    payload: std::result::Result<Json<NewCosigner>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let cosigner = registry::add_cosigner(&state.pool, charity_id, &caller, body(payload)?).await?;
    Ok(created(cosigner))
}

/// `DELETE /api/charities/:id/cosigners/:cosigner_id`
pub async fn remove_cosigner(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path((charity_id, cosigner_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse> {
    registry::remove_cosigner(&state.pool, charity_id, &caller, cosigner_id).await?;
    Ok(success(Removed { cosigner_id }))
}

/// `POST /api/charities/:id/budget`
pub async fn add_budget_category(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(charity_id): Path<i64>,
    payload: std::result::Result<Json<CategoryInput>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let category = ledger::add_category(&state.pool, charity_id, &caller, body(payload)?).await?;
    Ok(created(category))
}

/// `PATCH /api/charities/:id/budget/:category_id`
pub async fn update_budget_category(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path((charity_id, category_id)): Path<(i64, i64)>,
    payload: std::result::Result<Json<CategoryInput>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let category =
        ledger::update_category(&state.pool, charity_id, category_id, &caller, body(payload)?)
            .await?;
    Ok(success(category))
}

/// `PATCH /api/charities/:id/transfer-ownership`
pub async fn transfer_ownership(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(charity_id): Path<i64>,
    payload: std::result::Result<Json<OwnershipTransfer>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let charity =
        registry::transfer_ownership(&state.pool, charity_id, &caller, body(payload)?).await?;
    Ok(success(charity))
}

/// `DELETE /api/charities/:id/budget/:category_id`
pub async fn remove_budget_category(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path((charity_id, category_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse> {
    ledger::remove_category(&state.pool, charity_id, category_id, &caller).await?;
    Ok(success(RemovedCategory { category_id }))
}

/// `GET /api/charities/:id/events`
pub async fn list_events(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(charity_id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(success(events::history(&state.pool, charity_id, &caller).await?))
}

/// `GET /api/charities/:id/approvals`
///
/// Approvals still collecting signatures.
pub async fn list_pending_approvals(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(charity_id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(success(
        approvals::list_pending(&state.pool, charity_id, &caller).await?,
    ))
}

/// `POST /api/charities/:id/approvals`
pub async fn create_approval(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(charity_id): Path<i64>,
    payload: std::result::Result<Json<NewApproval>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let approval = approvals::create(&state.pool, charity_id, &caller, body(payload)?).await?;
    Ok(created(approval))
}

/// `POST /api/approvals/:approval_id/sign`
pub async fn sign_approval(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(approval_id): Path<i64>,
    payload: std::result::Result<Json<NewSignature>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let approval =
        approvals::add_signature(&state.pool, approval_id, &caller, body(payload)?).await?;
    Ok(success(approval))
}

/// `POST /api/approvals/:approval_id/execute`
pub async fn execute_approval(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(approval_id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(success(
        approvals::execute(&state.pool, approval_id, &caller).await?,
    ))
}

/// `POST /api/approvals/:approval_id/refund`
pub async fn refund_approval(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(approval_id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(success(
        approvals::refund(&state.pool, approval_id, &caller).await?,
    ))
}

/// `GET /api/approvals/:approval_id/milestones`
pub async fn list_milestones(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(approval_id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(success(
        milestones::list(&state.pool, approval_id, &caller).await?,
    ))
}

/// `POST /api/approvals/:approval_id/milestones`
pub async fn create_milestone(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(approval_id): Path<i64>,
    payload: std::result::Result<Json<NewMilestone>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let milestone =
        milestones::create(&state.pool, approval_id, &caller, body(payload)?).await?;
    Ok(created(milestone))
}

/// `PATCH /api/milestones/:milestone_id/complete`
///
/// `{}` completes without proof.
pub async fn complete_milestone(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(milestone_id): Path<i64>,
    payload: std::result::Result<Json<Completion>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let completed =
        milestones::complete(&state.pool, milestone_id, &caller, body(payload)?).await?;
    Ok(success(completed))
}

/// `PATCH /api/milestones/:milestone_id/verify`
pub async fn verify_milestone(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(milestone_id): Path<i64>,
    payload: std::result::Result<Json<Review>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let verified =
        milestones::verify(&state.pool, milestone_id, &caller, body(payload)?).await?;
    Ok(success(verified))
}

/// `POST /api/milestones/:milestone_id/release`
pub async fn release_milestone(
    State(state): State<Arc<ApiState>>,
    Authenticated(caller): Authenticated,
    Path(milestone_id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(success(
        milestones::release(&state.pool, milestone_id, &caller).await?,
    ))
}

// ─────────────────────────────────────────────────────────
// Routes
// ─────────────────────────────────────────────────────────

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/users", post(register_user))
        .route("/api/charities", post(create_charity))
        .route("/api/charities/:id", get(get_charity))
        .route("/api/charities/:id/multisig", patch(update_multisig))
        .route(
            "/api/charities/:id/transfer-ownership",
            patch(transfer_ownership),
        )
        .route("/api/charities/:id/cosigners", post(add_cosigner))
        .route(
            "/api/charities/:id/cosigners/:cosigner_id",
            delete(remove_cosigner),
        )
        .route("/api/charities/:id/budget", post(add_budget_category))
        .route(
            "/api/charities/:id/budget/:category_id",
            patch(update_budget_category).delete(remove_budget_category),
        )
        .route("/api/charities/:id/events", get(list_events))
        .route(
            "/api/charities/:id/approvals",
            get(list_pending_approvals).post(create_approval),
        )
        .route("/api/approvals/:approval_id/sign", post(sign_approval))
        .route("/api/approvals/:approval_id/execute", post(execute_approval))
        .route("/api/approvals/:approval_id/refund", post(refund_approval))
        .route(
            "/api/approvals/:approval_id/milestones",
            get(list_milestones).post(create_milestone),
        )
        .route(
            "/api/milestones/:milestone_id/complete",
            patch(complete_milestone),
        )
        .route("/api/milestones/:milestone_id/verify", patch(verify_milestone))
        .route(
            "/api/milestones/:milestone_id/release",
            post(release_milestone),
        )
        .with_state(state)
}
