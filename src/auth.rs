//! Caller identity. Tokens are HS256 JWTs carrying the user id and role;
//! issuing them belongs to an upstream identity service, `issue_token`
//! exists for tooling and tests.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::user::Role;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthUser {
    pub fn require_role(&self, allowed: &[Role]) -> Result<(), AppError> {
        if allowed.contains(&self.role) {
            return Ok(());
        }
        Err(AppError::Forbidden(format!(
            "{} role cannot perform this action",
            self.role
        )))
    }

    pub fn is_driver(&self) -> bool {
        self.role == Role::Driver
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).or_else(|| query_token(parts));
        let Some(token) = token else {
            return Err(AppError::Unauthorized);
        };
        verify_token(&state.config.jwt_secret, &token)
    }
}

/// `Authorization: Bearer <token>`.
fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// `?token=<token>`, for websocket clients that cannot set headers.
fn query_token(parts: &Parts) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.token)
        .filter(|token| !token.is_empty())
}

pub fn verify_token(secret: &str, token: &str) -> Result<AuthUser, AppError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|err| {
        tracing::debug!(error = %err, "rejected token");
        AppError::Unauthorized
    })?;

    Ok(AuthUser {
        user_id: data.claims.sub,
        role: data.claims.role,
    })
}

pub fn issue_token(
    secret: &str,
    user_id: Uuid,
    role: Role,
    ttl: Duration,
) -> Result<String, AppError> {
    let claims = Claims {
        sub: user_id,
        role,
        exp: (Utc::now() + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|err| AppError::Internal(format!("failed to sign token: {err}")))
}
