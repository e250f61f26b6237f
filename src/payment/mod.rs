//! Thin payment proxy. Records intents against completed rides, verifies
//! gateway callbacks and reports the outcome back onto the ride.

pub mod signature;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::models::payment::{
    CashPaymentRequest, CreatePaymentOrderRequest, DEFAULT_CURRENCY, Payment, PaymentOrder,
    PaymentState, UpiPaymentRequest, VerifyPaymentRequest,
};
use crate::models::ride::{PaymentMethod, PaymentStatus, RideStatus};
use crate::models::user::Role;
use crate::state::AppState;
use crate::store::PAYMENT_EXISTS;

pub async fn create_order(
    state: &AppState,
    caller: AuthUser,
    request: CreatePaymentOrderRequest,
) -> Result<PaymentOrder, AppError> {
    caller.require_role(&[Role::Rider])?;
    let ride = state.store.get_ride(request.ride_id).await?;
    if ride.rider_id != caller.user_id {
        return Err(AppError::Forbidden("not your ride".to_string()));
    }
    if ride.status != RideStatus::Completed {
        return Err(AppError::Conflict(
            "payment can only be created for a completed ride".to_string(),
        ));
    }
    if let Some(existing) = state.store.payment_for_ride(ride.id).await? {
        if existing.status != PaymentState::Failed {
            return Err(AppError::Conflict(PAYMENT_EXISTS.to_string()));
        }
    }

    let now = Utc::now();
    let id = Uuid::new_v4();
    let online = ride.payment_method != PaymentMethod::Cash;
    let key_id = state.config.payment_key_id.clone().filter(|_| online);
    let payment = Payment {
        id,
        ride_id: ride.id,
        rider_id: ride.rider_id,
        amount: ride.fare,
        currency: DEFAULT_CURRENCY.to_string(),
        gateway_order_id: key_id.as_ref().map(|_| format!("order_{}", id.simple())),
        gateway_payment_id: None,
        gateway_signature: None,
        status: if online {
            PaymentState::Created
        } else {
            PaymentState::Pending
        },
        payment_method: ride.payment_method,
        created_at: now,
        updated_at: now,
    };
    // the store rejects a second open payment that slipped past the check above
    let payment = state.store.insert_payment(payment).await?;
    info!(
        payment_id = %payment.id,
        ride_id = %ride.id,
        amount = payment.amount,
        method = %payment.payment_method,
        "payment order created"
    );

    Ok(PaymentOrder {
        payment_id: payment.id,
        gateway_order_id: payment.gateway_order_id,
        gateway_key_id: key_id,
        amount: payment.amount,
        currency: payment.currency,
        payment_method: payment.payment_method,
    })
}

/// Checks the gateway callback signature. A bad signature fails the
/// payment and the ride's payment status. Both outcomes are written only
/// while the payment is still open, so a late callback cannot overturn a
/// settled one.
pub async fn verify(
    state: &AppState,
    caller: AuthUser,
    request: VerifyPaymentRequest,
) -> Result<Payment, AppError> {
    let mut payment = owned_payment(state, caller, request.payment_id).await?;
    if !payment.status.is_open() {
        return Err(closed());
    }
    if payment.gateway_order_id.as_deref() != Some(request.gateway_order_id.as_str()) {
        return Err(AppError::BadRequest(
            "gateway order does not match this payment".to_string(),
        ));
    }
    let secret = state
        .config
        .payment_key_secret
        .as_deref()
        .ok_or_else(|| AppError::Internal("payment gateway secret is not configured".to_string()))?;

    let valid = signature::verify(
        secret,
        &request.gateway_order_id,
        &request.gateway_payment_id,
        &request.signature,
    )?;

    payment.gateway_payment_id = Some(request.gateway_payment_id);
    payment.gateway_signature = Some(request.signature);
    payment.updated_at = Utc::now();

    if !valid {
        payment.status = PaymentState::Failed;
        let payment = write_open(state, payment).await?;
        state
            .store
            .update_payment_status(payment.ride_id, PaymentStatus::Failed, Some(payment.id))
            .await?;
        warn!(payment_id = %payment.id, ride_id = %payment.ride_id, "payment signature mismatch");
        return Err(AppError::BadRequest("invalid payment signature".to_string()));
    }

    payment.status = PaymentState::Captured;
    let payment = write_open(state, payment).await?;
    state
        .store
        .update_payment_status(payment.ride_id, PaymentStatus::Completed, Some(payment.id))
        .await?;
    info!(payment_id = %payment.id, ride_id = %payment.ride_id, "payment captured");
    Ok(payment)
}

pub async fn confirm_cash(
    state: &AppState,
    caller: AuthUser,
    request: CashPaymentRequest,
) -> Result<Payment, AppError> {
    let mut payment = owned_payment(state, caller, request.payment_id).await?;
    if payment.payment_method != PaymentMethod::Cash {
        return Err(AppError::BadRequest("not a cash payment".to_string()));
    }
    if !payment.status.is_open() {
        return Err(closed());
    }

    payment.status = PaymentState::Captured;
    payment.updated_at = Utc::now();
    let payment = write_open(state, payment).await?;
    state
        .store
        .update_payment_status(payment.ride_id, PaymentStatus::Completed, Some(payment.id))
        .await?;
    info!(payment_id = %payment.id, ride_id = %payment.ride_id, "cash payment confirmed");
    Ok(payment)
}

/// Records that the rider started a UPI collect request. The payment waits
/// in `pending` until the gateway callback is verified.
pub async fn start_upi(
    state: &AppState,
    caller: AuthUser,
    request: UpiPaymentRequest,
) -> Result<Payment, AppError> {
    request.validate()?;
    let mut payment = owned_payment(state, caller, request.payment_id).await?;
    if payment.payment_method != PaymentMethod::Upi {
        return Err(AppError::BadRequest("not a upi payment".to_string()));
    }
    if !payment.status.is_open() {
        return Err(closed());
    }

    payment.status = PaymentState::Pending;
    payment.updated_at = Utc::now();
    let payment = write_open(state, payment).await?;
    info!(payment_id = %payment.id, ride_id = %payment.ride_id, "upi payment pending");
    Ok(payment)
}

pub async fn get(state: &AppState, caller: AuthUser, payment_id: Uuid) -> Result<Payment, AppError> {
    if caller.role == Role::Admin {
        return Ok(state.store.get_payment(payment_id).await?);
    }
    owned_payment(state, caller, payment_id).await
}

/// Latest payment recorded for a ride, for its rider or an admin.
pub async fn for_ride(state: &AppState, caller: AuthUser, ride_id: Uuid) -> Result<Payment, AppError> {
    let ride = state.store.get_ride(ride_id).await?;
    if caller.role != Role::Admin && ride.rider_id != caller.user_id {
        return Err(AppError::Forbidden("not your ride".to_string()));
    }
    state
        .store
        .payment_for_ride(ride.id)
        .await?
        .ok_or_else(|| AppError::NotFound("no payment for this ride".to_string()))
}

async fn write_open(state: &AppState, payment: Payment) -> Result<Payment, AppError> {
    state.store.update_payment(payment).await?.ok_or_else(closed)
}

fn closed() -> AppError {
    AppError::Conflict("payment is no longer open".to_string())
}

async fn owned_payment(
    state: &AppState,
    caller: AuthUser,
    payment_id: Uuid,
) -> Result<Payment, AppError> {
    let payment = state.store.get_payment(payment_id).await?;
    if payment.rider_id != caller.user_id {
        return Err(AppError::Forbidden("not your payment".to_string()));
    }
    Ok(payment)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::engine::fare;
    use crate::models::location::GeoPoint;
    use crate::models::ride::{Ride, RideRequest, VehicleType};
    use crate::store::MemoryStore;

    fn state_with_gateway() -> AppState {
        let config = Config {
            payment_key_id: Some("key_test".to_string()),
            payment_key_secret: Some("gateway-secret".to_string()),
            ..Config::default()
        };
        AppState::new(config, Arc::new(MemoryStore::new())).0
    }

    async fn completed_ride(state: &AppState, method: PaymentMethod) -> (AuthUser, Ride) {
        let rider = AuthUser {
            user_id: Uuid::new_v4(),
            role: Role::Rider,
        };
        let request = RideRequest {
            pickup_location: GeoPoint::new(12.9716, 77.5946),
            pickup_address: "MG Road Metro".to_string(),
            dropoff_location: GeoPoint::new(12.9352, 77.6245),
            dropoff_address: "Koramangala 5th Block".to_string(),
            vehicle_type: VehicleType::Sedan,
            payment_method: method,
        };
        let estimate = fare::estimate(&request.pickup_location, &request.dropoff_location);
        let ride = Ride::new_request(rider.user_id, &request, estimate, Utc::now());
        let ride = state.store.insert_ride(ride).await.unwrap();

        let driver_id = Uuid::new_v4();
        let store = &state.store;
        store
            .accept_ride(ride.id, driver_id, "1234".to_string(), Utc::now())
            .await
            .unwrap();
        store.start_ride(ride.id, driver_id, Utc::now()).await.unwrap().unwrap();
        let ride = store
            .complete_ride(ride.id, driver_id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        (rider, ride)
    }

    #[tokio::test]
    async fn cash_payment_settles_the_ride() {
        let state = state_with_gateway();
        let (rider, ride) = completed_ride(&state, PaymentMethod::Cash).await;

        let order = create_order(&state, rider, CreatePaymentOrderRequest { ride_id: ride.id })
            .await
            .unwrap();
        assert_eq!(order.gateway_order_id, None);
        assert_eq!(order.amount, ride.fare);

        let duplicate = create_order(&state, rider, CreatePaymentOrderRequest { ride_id: ride.id })
            .await
            .unwrap_err();
        assert!(matches!(duplicate, AppError::Conflict(_)));

        let payment = confirm_cash(
            &state,
            rider,
            CashPaymentRequest {
                payment_id: order.payment_id,
            },
        )
        .await
        .unwrap();
        assert_eq!(payment.status, PaymentState::Captured);

        let ride = state.store.get_ride(ride.id).await.unwrap();
        assert_eq!(ride.payment_status, PaymentStatus::Completed);
        assert_eq!(ride.payment_id, Some(payment.id));
    }

    #[tokio::test]
    async fn valid_signature_captures_online_payment() {
        let state = state_with_gateway();
        let (rider, ride) = completed_ride(&state, PaymentMethod::Upi).await;
        let order = create_order(&state, rider, CreatePaymentOrderRequest { ride_id: ride.id })
            .await
            .unwrap();
        let order_id = order.gateway_order_id.unwrap();
        assert_eq!(order.gateway_key_id.as_deref(), Some("key_test"));

        let signature = signature::sign("gateway-secret", &order_id, "pay_42").unwrap();
        let payment = verify(
            &state,
            rider,
            VerifyPaymentRequest {
                payment_id: order.payment_id,
                gateway_order_id: order_id,
                gateway_payment_id: "pay_42".to_string(),
                signature,
            },
        )
        .await
        .unwrap();
        assert_eq!(payment.status, PaymentState::Captured);
        assert_eq!(
            state.store.get_ride(ride.id).await.unwrap().payment_status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn bad_signature_fails_payment_and_ride() {
        let state = state_with_gateway();
        let (rider, ride) = completed_ride(&state, PaymentMethod::Card).await;
        let order = create_order(&state, rider, CreatePaymentOrderRequest { ride_id: ride.id })
            .await
            .unwrap();

        let err = verify(
            &state,
            rider,
            VerifyPaymentRequest {
                payment_id: order.payment_id,
                gateway_order_id: order.gateway_order_id.unwrap(),
                gateway_payment_id: "pay_42".to_string(),
                signature: "00".repeat(32),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(msg) if msg == "invalid payment signature"));

        let payment = state.store.get_payment(order.payment_id).await.unwrap();
        assert_eq!(payment.status, PaymentState::Failed);
        assert_eq!(
            state.store.get_ride(ride.id).await.unwrap().payment_status,
            PaymentStatus::Failed
        );

        // a failed payment may be retried
        assert!(
            create_order(&state, rider, CreatePaymentOrderRequest { ride_id: ride.id })
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn other_riders_cannot_touch_the_payment() {
        let state = state_with_gateway();
        let (rider, ride) = completed_ride(&state, PaymentMethod::Cash).await;
        let order = create_order(&state, rider, CreatePaymentOrderRequest { ride_id: ride.id })
            .await
            .unwrap();

        let stranger = AuthUser {
            user_id: Uuid::new_v4(),
            role: Role::Rider,
        };
        let err = get(&state, stranger, order.payment_id).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_orders_record_one_payment() {
        let state = Arc::new(state_with_gateway());
        let (rider, ride) = completed_ride(&state, PaymentMethod::Cash).await;
        let ride_id = ride.id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                tokio::spawn(async move {
                    create_order(&state, rider, CreatePaymentOrderRequest { ride_id }).await
                })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(err) => assert!(matches!(err, AppError::Conflict(msg) if msg == PAYMENT_EXISTS)),
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn late_forged_callback_cannot_fail_a_captured_payment() {
        let state = state_with_gateway();
        let (rider, ride) = completed_ride(&state, PaymentMethod::Upi).await;
        let order = create_order(&state, rider, CreatePaymentOrderRequest { ride_id: ride.id })
            .await
            .unwrap();
        let order_id = order.gateway_order_id.unwrap();
        let read_before_capture = state.store.get_payment(order.payment_id).await.unwrap();

        let signature = signature::sign("gateway-secret", &order_id, "pay_42").unwrap();
        verify(
            &state,
            rider,
            VerifyPaymentRequest {
                payment_id: order.payment_id,
                gateway_order_id: order_id.clone(),
                gateway_payment_id: "pay_42".to_string(),
                signature,
            },
        )
        .await
        .unwrap();

        let mut forged = read_before_capture;
        forged.status = PaymentState::Failed;
        assert!(state.store.update_payment(forged).await.unwrap().is_none());

        let err = verify(
            &state,
            rider,
            VerifyPaymentRequest {
                payment_id: order.payment_id,
                gateway_order_id: order_id,
                gateway_payment_id: "pay_43".to_string(),
                signature: "00".repeat(32),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let payment = state.store.get_payment(order.payment_id).await.unwrap();
        assert_eq!(payment.status, PaymentState::Captured);
        assert_eq!(payment.gateway_payment_id.as_deref(), Some("pay_42"));
        assert_eq!(
            state.store.get_ride(ride.id).await.unwrap().payment_status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn upi_collect_marks_the_payment_pending() {
        let state = state_with_gateway();
        let (rider, ride) = completed_ride(&state, PaymentMethod::Upi).await;
        let order = create_order(&state, rider, CreatePaymentOrderRequest { ride_id: ride.id })
            .await
            .unwrap();

        let bad = start_upi(
            &state,
            rider,
            UpiPaymentRequest {
                payment_id: order.payment_id,
                upi_id: "not-a-vpa".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(bad, AppError::BadRequest(_)));

        let payment = start_upi(
            &state,
            rider,
            UpiPaymentRequest {
                payment_id: order.payment_id,
                upi_id: "asha.rao@okbank".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(payment.status, PaymentState::Pending);
        assert_eq!(
            state.store.get_ride(ride.id).await.unwrap().payment_status,
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn upi_collect_rejects_cash_payments() {
        let state = state_with_gateway();
        let (rider, ride) = completed_ride(&state, PaymentMethod::Cash).await;
        let order = create_order(&state, rider, CreatePaymentOrderRequest { ride_id: ride.id })
            .await
            .unwrap();

        let err = start_upi(
            &state,
            rider,
            UpiPaymentRequest {
                payment_id: order.payment_id,
                upi_id: "asha.rao@okbank".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(msg) if msg == "not a upi payment"));
    }

    #[tokio::test]
    async fn payment_by_ride_is_visible_to_its_rider_and_admins() {
        let state = state_with_gateway();
        let (rider, ride) = completed_ride(&state, PaymentMethod::Cash).await;

        let missing = for_ride(&state, rider, ride.id).await.unwrap_err();
        assert!(matches!(missing, AppError::NotFound(_)));

        let order = create_order(&state, rider, CreatePaymentOrderRequest { ride_id: ride.id })
            .await
            .unwrap();
        assert_eq!(for_ride(&state, rider, ride.id).await.unwrap().id, order.payment_id);

        let admin = AuthUser {
            user_id: Uuid::new_v4(),
            role: Role::Admin,
        };
        assert!(for_ride(&state, admin, ride.id).await.is_ok());

        let stranger = AuthUser {
            user_id: Uuid::new_v4(),
            role: Role::Rider,
        };
        let err = for_ride(&state, stranger, ride.id).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
