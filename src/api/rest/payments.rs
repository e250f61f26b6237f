use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::models::payment::{
    CashPaymentRequest, CreatePaymentOrderRequest, Payment, PaymentOrder, UpiPaymentRequest,
    VerifyPaymentRequest,
};
use crate::payment;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/payments/orders", post(create_order))
        .route("/payments/verify", post(verify_payment))
        .route("/payments/cash", post(confirm_cash))
        .route("/payments/upi", post(start_upi))
        .route("/payments/ride/:ride_id", get(get_ride_payment))
        .route("/payments/:id", get(get_payment))
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(payload): Json<CreatePaymentOrderRequest>,
) -> Result<(StatusCode, Json<PaymentOrder>), AppError> {
    let order = payment::create_order(&state, caller, payload).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn verify_payment(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(payload): Json<VerifyPaymentRequest>,
) -> Result<Json<Payment>, AppError> {
    Ok(Json(payment::verify(&state, caller, payload).await?))
}

async fn confirm_cash(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(payload): Json<CashPaymentRequest>,
) -> Result<Json<Payment>, AppError> {
    Ok(Json(payment::confirm_cash(&state, caller, payload).await?))
}

async fn start_upi(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(payload): Json<UpiPaymentRequest>,
) -> Result<Json<Payment>, AppError> {
    Ok(Json(payment::start_upi(&state, caller, payload).await?))
}

async fn get_ride_payment(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<Payment>, AppError> {
    Ok(Json(payment::for_ride(&state, caller, ride_id).await?))
}

async fn get_payment(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>, AppError> {
    Ok(Json(payment::get(&state, caller, id).await?))
}
