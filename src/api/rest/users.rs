use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Json;
use axum::Router;
use chrono::Utc;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::models::user::{UpsertUserRequest, User};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/users/me", get(get_me).put(upsert_me))
}

async fn get_me(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
) -> Result<Json<User>, AppError> {
    Ok(Json(state.store.get_user(caller.user_id).await?))
}

/// Name and phone only. Role always comes from the token.
async fn upsert_me(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(payload): Json<UpsertUserRequest>,
) -> Result<Json<User>, AppError> {
    payload.validate()?;

    let now = Utc::now();
    let user = User {
        id: caller.user_id,
        name: payload.name.trim().to_string(),
        phone: payload.phone,
        role: caller.role,
        created_at: now,
        updated_at: now,
    };
    Ok(Json(state.store.upsert_user(user).await?))
}
