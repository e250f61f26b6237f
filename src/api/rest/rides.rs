use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Serialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::engine::{location, rides};
use crate::error::AppError;
use crate::models::location::NearbyQuery;
use crate::models::ride::{NearbyRide, RateRideRequest, RideRequest, RideView, StartRideRequest};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rides", post(create_ride))
        .route("/rides/active", get(active_ride))
        .route("/rides/nearby", get(nearby_rides))
        .route("/rides/:id", get(get_ride))
        .route("/rides/:id/accept", post(accept_ride))
        .route("/rides/:id/start", post(start_ride))
        .route("/rides/:id/complete", post(complete_ride))
        .route("/rides/:id/cancel", post(cancel_ride))
        .route("/rides/:id/rate", post(rate_ride))
}

async fn create_ride(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(payload): Json<RideRequest>,
) -> Result<(StatusCode, Json<RideView>), AppError> {
    let view = rides::create_request(&state, caller, payload).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_ride(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<RideView>, AppError> {
    Ok(Json(rides::get_ride(&state, caller, id).await?))
}

async fn active_ride(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
) -> Result<Json<RideView>, AppError> {
    Ok(Json(rides::get_active(&state, caller).await?))
}

#[derive(Serialize)]
struct NearbyRidesResponse {
    rides: Vec<NearbyRide>,
    count: usize,
}

async fn nearby_rides(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<NearbyRidesResponse>, AppError> {
    let rides = location::nearby_rides(&state, caller, &query).await?;
    Ok(Json(NearbyRidesResponse {
        count: rides.len(),
        rides,
    }))
}

async fn accept_ride(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<RideView>, AppError> {
    Ok(Json(rides::accept(&state, caller, id).await?))
}

async fn start_ride(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<StartRideRequest>,
) -> Result<Json<RideView>, AppError> {
    Ok(Json(
        rides::start_with_otp(&state, caller, id, payload.otp.trim()).await?,
    ))
}

async fn complete_ride(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<RideView>, AppError> {
    Ok(Json(rides::complete(&state, caller, id).await?))
}

async fn cancel_ride(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<RideView>, AppError> {
    Ok(Json(rides::cancel(&state, caller, id).await?))
}

async fn rate_ride(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<RateRideRequest>,
) -> Result<Json<RideView>, AppError> {
    Ok(Json(rides::rate(&state, caller, id, payload).await?))
}
