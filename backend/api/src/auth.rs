//! Bearer credential resolution.
//!
//! Handlers that take [`Authenticated`] only run once the
//! `Authorization: Bearer <credential>` header resolves to a registered user.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use cleargive_protocol::AuthenticatedCaller;
use tracing::debug;

use crate::api::ApiState;
use crate::db;
use crate::errors::AppError;

/// The resolved caller, passed explicitly into every workflow call.
#[derive(Debug, Clone)]
pub struct Authenticated(pub AuthenticatedCaller);

#[async_trait]
impl FromRequestParts<Arc<ApiState>> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or_else(|| AppError::unauthenticated("Authorization header is required"))?;
        let credential = header
            .to_str()
            .ok()
            .and_then(bearer_credential)
            .ok_or_else(|| {
                AppError::unauthenticated("Authorization header format must be Bearer {token}")
            })?;

        match db::find_caller_by_credential(&state.pool, credential).await? {
            Some(caller) => Ok(Authenticated(caller)),
            None => {
                debug!("unknown bearer credential");
                Err(AppError::unauthenticated("Invalid or expired credential"))
            }
        }
    }
}

fn bearer_credential(value: &str) -> Option<&str> {
    let (scheme, credential) = value.split_once(' ')?;
    let credential = credential.trim();
    if scheme != "Bearer" || credential.is_empty() || credential.contains(' ') {
        return None;
    }
    Some(credential)
}
