use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::AuthUser;
use crate::engine::{location, rides};
use crate::error::AppError;
use crate::models::driver::{CreateDriverRequest, Driver};
use crate::models::location::{LocationUpdate, NearbyDriver, NearbyQuery};
use crate::models::user::Role;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/drivers/profile",
            post(create_profile).get(get_profile).put(update_profile),
        )
        .route("/drivers/location", post(update_location))
        .route("/drivers/availability", post(set_availability))
        .route("/drivers/nearby", get(nearby_drivers))
}

async fn create_profile(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(payload): Json<CreateDriverRequest>,
) -> Result<(StatusCode, Json<Driver>), AppError> {
    caller.require_role(&[Role::Driver])?;
    payload.validate()?;

    let driver = state
        .store
        .create_driver(payload.into_driver(caller.user_id, Utc::now()))
        .await?;
    info!(driver_id = %driver.id, user_id = %caller.user_id, "driver profile created");

    Ok((StatusCode::CREATED, Json(driver)))
}

async fn update_profile(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(payload): Json<CreateDriverRequest>,
) -> Result<Json<Driver>, AppError> {
    caller.require_role(&[Role::Driver])?;
    payload.validate()?;

    let existing = rides::driver_for(&state, caller.user_id).await?;
    let driver = state
        .store
        .update_driver(payload.apply_to(existing, Utc::now()))
        .await?;
    info!(driver_id = %driver.id, user_id = %caller.user_id, "driver profile updated");

    Ok(Json(driver))
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
) -> Result<Json<Driver>, AppError> {
    caller.require_role(&[Role::Driver])?;
    Ok(Json(rides::driver_for(&state, caller.user_id).await?))
}

#[derive(Serialize)]
struct Ack {
    status: &'static str,
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(payload): Json<LocationUpdate>,
) -> Result<Json<Ack>, AppError> {
    location::update_location(&state, caller, &payload)?;
    Ok(Json(Ack { status: "ok" }))
}

#[derive(Deserialize, Serialize)]
struct Availability {
    available: bool,
}

async fn set_availability(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(payload): Json<Availability>,
) -> Result<Json<Availability>, AppError> {
    location::set_availability(&state, caller, payload.available)?;
    Ok(Json(payload))
}

#[derive(Serialize)]
struct NearbyDriversResponse {
    drivers: Vec<NearbyDriver>,
    count: usize,
}

async fn nearby_drivers(
    State(state): State<Arc<AppState>>,
    _caller: AuthUser,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<NearbyDriversResponse>, AppError> {
    let drivers = location::nearby_drivers(&state, &query)?;
    Ok(Json(NearbyDriversResponse {
        count: drivers.len(),
        drivers,
    }))
}
