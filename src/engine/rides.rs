//! Ride lifecycle. Every transition that depends on the current row goes
//! through a guarded store call; nothing here reads a status and then
//! writes unconditionally.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::engine::{dispatch, fare, otp};
use crate::error::AppError;
use crate::models::driver::Driver;
use crate::models::ride::{
    Audience, DriverSummary, RateRideRequest, Ride, RideRequest, RideStatus, RideView,
};
use crate::models::user::Role;
use crate::realtime::message::ServerEvent;
use crate::state::AppState;
use crate::store::StoreError;

pub async fn create_request(
    state: &Arc<AppState>,
    caller: AuthUser,
    request: RideRequest,
) -> Result<RideView, AppError> {
    caller.require_role(&[Role::Rider])?;
    request.validate()?;

    let estimate = fare::estimate(&request.pickup_location, &request.dropoff_location);
    let ride = Ride::new_request(caller.user_id, &request, estimate, Utc::now());
    let ride = state.store.insert_ride(ride).await?;

    state.pending.register(ride.id, ride.pickup_location);
    state.refresh_pending_gauge();
    state.metrics.record_transition("requested");
    info!(
        ride_id = %ride.id,
        rider_id = %ride.rider_id,
        distance_km = ride.distance_km,
        fare = ride.fare,
        "ride requested"
    );

    dispatch::spawn_broadcast(state.clone(), ride.clone());
    Ok(RideView::render(&ride, Audience::Rider, None))
}

pub async fn accept(
    state: &AppState,
    caller: AuthUser,
    ride_id: Uuid,
) -> Result<RideView, AppError> {
    caller.require_role(&[Role::Driver])?;
    let driver = driver_for(state, caller.user_id).await?;

    let ride = match state
        .store
        .accept_ride(ride_id, driver.id, otp::generate(), Utc::now())
        .await
    {
        Ok(ride) => ride,
        Err(StoreError::Conflict(reason)) => {
            state.metrics.accept_conflicts_total.inc();
            info!(%ride_id, driver_id = %driver.id, %reason, "accept lost");
            return Err(AppError::Conflict(reason));
        }
        Err(err) => return Err(err.into()),
    };

    state.pending.remove(&ride.id);
    state.refresh_pending_gauge();
    state.metrics.record_transition("accepted");
    info!(%ride_id, driver_id = %driver.id, "ride accepted");

    let summary = summarize(state, &driver).await;
    state.hub.send_to_user(
        ride.rider_id,
        &ServerEvent::RideAccepted(RideView::render(&ride, Audience::Rider, Some(summary.clone()))),
    );
    Ok(RideView::render(&ride, Audience::Driver, Some(summary)))
}

/// Starts the ride only when `code` matches the OTP issued at acceptance.
pub async fn start_with_otp(
    state: &AppState,
    caller: AuthUser,
    ride_id: Uuid,
    code: &str,
) -> Result<RideView, AppError> {
    caller.require_role(&[Role::Driver])?;
    otp::validate_format(code)?;
    let driver = driver_for(state, caller.user_id).await?;
    let ride = state.store.get_ride(ride_id).await?;

    if ride.driver_id != Some(driver.id) {
        return Err(AppError::Forbidden(
            "ride is not assigned to this driver".to_string(),
        ));
    }
    if ride.otp.as_deref() != Some(code) {
        warn!(%ride_id, driver_id = %driver.id, "otp mismatch");
        return Err(AppError::BadRequest("invalid otp".to_string()));
    }
    if !ride.status.is_startable() {
        return Err(AppError::Conflict(format!(
            "ride cannot be started from {}",
            ride.status
        )));
    }

    start(state, &driver, ride_id).await
}

/// Guarded transition to `in_progress`. Losing a race, a wrong driver and a
/// wrong state all look the same: no row matched.
pub async fn start(state: &AppState, driver: &Driver, ride_id: Uuid) -> Result<RideView, AppError> {
    let ride = state
        .store
        .start_ride(ride_id, driver.id, Utc::now())
        .await?
        .ok_or_else(|| AppError::BadRequest("cannot start ride".to_string()))?;

    state.metrics.record_transition("started");
    info!(%ride_id, driver_id = %driver.id, "ride started");

    let summary = summarize(state, driver).await;
    state.hub.send_to_user(
        ride.rider_id,
        &ServerEvent::RideStarted(RideView::render(&ride, Audience::Rider, Some(summary.clone()))),
    );
    Ok(RideView::render(&ride, Audience::Driver, Some(summary)))
}

pub async fn complete(
    state: &AppState,
    caller: AuthUser,
    ride_id: Uuid,
) -> Result<RideView, AppError> {
    caller.require_role(&[Role::Driver])?;
    let driver = driver_for(state, caller.user_id).await?;

    let ride = state
        .store
        .complete_ride(ride_id, driver.id, Utc::now())
        .await?
        .ok_or_else(|| AppError::BadRequest("cannot complete ride".to_string()))?;

    state.metrics.record_transition("completed");
    info!(%ride_id, driver_id = %driver.id, fare = ride.fare, "ride completed");

    let summary = summarize(state, &driver).await;
    state.hub.send_to_user(
        ride.rider_id,
        &ServerEvent::RideCompleted(RideView::render(
            &ride,
            Audience::Rider,
            Some(summary.clone()),
        )),
    );
    Ok(RideView::render(&ride, Audience::Driver, Some(summary)))
}

/// Rider-only. The assigned driver, if any, is told about it.
pub async fn cancel(
    state: &AppState,
    caller: AuthUser,
    ride_id: Uuid,
) -> Result<RideView, AppError> {
    let ride = state.store.get_ride(ride_id).await?;
    if ride.rider_id != caller.user_id {
        return Err(AppError::Forbidden(
            "only the rider can cancel this ride".to_string(),
        ));
    }
    if ride.status.is_terminal() {
        return Err(AppError::Conflict("ride cannot be cancelled".to_string()));
    }

    let ride = state
        .store
        .cancel_ride(ride_id, caller.user_id, Utc::now())
        .await?
        .ok_or_else(|| AppError::Conflict("ride cannot be cancelled".to_string()))?;

    state.pending.remove(&ride.id);
    state.refresh_pending_gauge();
    state.metrics.record_transition("cancelled");
    info!(%ride_id, rider_id = %caller.user_id, "ride cancelled");

    let driver = assigned_driver(state, &ride).await;
    let summary = match &driver {
        Some(driver) => Some(summarize(state, driver).await),
        None => None,
    };
    if let Some(driver) = &driver {
        state.hub.send_to_user(
            driver.user_id,
            &ServerEvent::RideCancelled(RideView::render(&ride, Audience::Driver, summary.clone())),
        );
    }
    Ok(RideView::render(&ride, Audience::Rider, summary))
}

pub async fn rate(
    state: &AppState,
    caller: AuthUser,
    ride_id: Uuid,
    request: RateRideRequest,
) -> Result<RideView, AppError> {
    request.validate()?;
    let ride = state.store.get_ride(ride_id).await?;
    if ride.rider_id != caller.user_id {
        return Err(AppError::Forbidden(
            "only the rider can rate this ride".to_string(),
        ));
    }
    if ride.status != RideStatus::Completed {
        return Err(AppError::Conflict(
            "only completed rides can be rated".to_string(),
        ));
    }
    if ride.rating.is_some() {
        return Err(AppError::Conflict("ride has already been rated".to_string()));
    }

    let feedback = request
        .feedback
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());
    let ride = state
        .store
        .rate_ride(ride_id, caller.user_id, request.rating, feedback, Utc::now())
        .await?
        .ok_or_else(|| AppError::Conflict("ride has already been rated".to_string()))?;

    state.metrics.record_transition("rated");
    info!(%ride_id, rating = request.rating, "ride rated");

    if let Some(driver_id) = ride.driver_id {
        let store = state.store.clone();
        tokio::spawn(async move {
            match store.recompute_driver_rating(driver_id).await {
                Ok(rating) => info!(%driver_id, rating, "driver rating updated"),
                Err(err) => error!(%driver_id, error = %err, "driver rating update failed"),
            }
        });
    }

    render(state, &ride, Audience::Rider).await
}

/// The caller's single non-terminal ride.
pub async fn get_active(state: &AppState, caller: AuthUser) -> Result<RideView, AppError> {
    caller.require_role(&[Role::Rider, Role::Driver])?;

    let (ride, audience) = if caller.is_driver() {
        let driver = driver_for(state, caller.user_id).await?;
        (
            state.store.active_ride_for_driver(driver.id).await?,
            Audience::Driver,
        )
    } else {
        (
            state.store.active_ride_for_rider(caller.user_id).await?,
            Audience::Rider,
        )
    };

    let ride = ride.ok_or_else(|| AppError::NotFound("no active ride".to_string()))?;
    render(state, &ride, audience).await
}

pub async fn get_ride(
    state: &AppState,
    caller: AuthUser,
    ride_id: Uuid,
) -> Result<RideView, AppError> {
    let ride = state.store.get_ride(ride_id).await?;

    let audience = if ride.rider_id == caller.user_id {
        Audience::Rider
    } else if caller.role == Role::Admin {
        Audience::Driver
    } else if caller.is_driver() {
        let driver = driver_for(state, caller.user_id).await?;
        if ride.driver_id != Some(driver.id) {
            return Err(AppError::Forbidden(
                "ride is not assigned to this driver".to_string(),
            ));
        }
        Audience::Driver
    } else {
        return Err(AppError::Forbidden("not a party to this ride".to_string()));
    };

    render(state, &ride, audience).await
}

pub(crate) async fn driver_for(state: &AppState, user_id: Uuid) -> Result<Driver, AppError> {
    match state.store.get_driver_by_user(user_id).await {
        Ok(driver) => Ok(driver),
        Err(StoreError::NotFound { .. }) => {
            Err(AppError::NotFound("driver profile not found".to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

async fn assigned_driver(state: &AppState, ride: &Ride) -> Option<Driver> {
    let driver_id = ride.driver_id?;
    match state.store.get_driver(driver_id).await {
        Ok(driver) => Some(driver),
        Err(err) => {
            warn!(ride_id = %ride.id, %driver_id, error = %err, "assigned driver lookup failed");
            None
        }
    }
}

/// Name and phone come from the driver's user record and may be blank if
/// the driver never set them. Location is the live presence position.
async fn summarize(state: &AppState, driver: &Driver) -> DriverSummary {
    let user = state.store.get_user(driver.user_id).await.ok();
    DriverSummary {
        id: driver.id,
        name: user.as_ref().map(|u| u.name.clone()).unwrap_or_default(),
        phone: user.and_then(|u| u.phone).unwrap_or_default(),
        vehicle_type: driver.vehicle_type,
        vehicle_number: driver.vehicle_number.clone(),
        rating: driver.rating,
        location: state.presence.get_location(&driver.user_id).ok(),
    }
}

async fn render(state: &AppState, ride: &Ride, audience: Audience) -> Result<RideView, AppError> {
    let summary = match assigned_driver(state, ride).await {
        Some(driver) => Some(summarize(state, &driver).await),
        None => None,
    };
    Ok(RideView::render(ride, audience, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::driver::CreateDriverRequest;
    use crate::models::location::GeoPoint;
    use crate::models::ride::{PaymentMethod, VehicleType};
    use crate::store::MemoryStore;

    fn test_state() -> Arc<AppState> {
        let (state, hub) = AppState::new(Config::default(), Arc::new(MemoryStore::new()));
        tokio::spawn(hub.run());
        Arc::new(state)
    }

    fn rider() -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
            role: Role::Rider,
        }
    }

    async fn driver(state: &AppState) -> AuthUser {
        let caller = AuthUser {
            user_id: Uuid::new_v4(),
            role: Role::Driver,
        };
        let profile = CreateDriverRequest {
            vehicle_type: VehicleType::Auto,
            vehicle_number: "KA01AB1234".to_string(),
            capacity: 3,
        }
        .into_driver(caller.user_id, Utc::now());
        state.store.create_driver(profile).await.unwrap();
        caller
    }

    fn request() -> RideRequest {
        RideRequest {
            pickup_location: GeoPoint::new(12.9716, 77.5946),
            pickup_address: "MG Road Metro".to_string(),
            dropoff_location: GeoPoint::new(12.9352, 77.6245),
            dropoff_address: "Koramangala 5th Block".to_string(),
            vehicle_type: VehicleType::Auto,
            payment_method: PaymentMethod::Cash,
        }
    }

    #[tokio::test]
    async fn create_registers_pending_request() {
        let state = test_state();
        let view = create_request(&state, rider(), request()).await.unwrap();

        assert_eq!(view.status, RideStatus::Requested);
        assert_eq!(view.duration_minutes, 11);
        assert!((view.fare - 114.22).abs() < 1e-9);
        assert!(state.pending.contains(&view.id));
    }

    #[tokio::test]
    async fn drivers_cannot_request_rides() {
        let state = test_state();
        let caller = driver(&state).await;
        let err = create_request(&state, caller, request()).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn second_accept_conflicts() {
        let state = test_state();
        let view = create_request(&state, rider(), request()).await.unwrap();
        let first = driver(&state).await;
        let second = driver(&state).await;

        let accepted = accept(&state, first, view.id).await.unwrap();
        assert_eq!(accepted.status, RideStatus::Accepted);
        assert_eq!(accepted.otp, None);
        assert!(!state.pending.contains(&view.id));

        let err = accept(&state, second, view.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(state.metrics.accept_conflicts_total.get(), 1);
    }

    #[tokio::test]
    async fn accept_without_profile_is_not_found() {
        let state = test_state();
        let view = create_request(&state, rider(), request()).await.unwrap();
        let stranger = AuthUser {
            user_id: Uuid::new_v4(),
            role: Role::Driver,
        };
        let err = accept(&state, stranger, view.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(msg) if msg == "driver profile not found"));
    }

    #[tokio::test]
    async fn otp_gates_the_start() {
        let state = test_state();
        let rider = rider();
        let view = create_request(&state, rider, request()).await.unwrap();
        let driver = driver(&state).await;
        accept(&state, driver, view.id).await.unwrap();

        let code = get_active(&state, rider).await.unwrap().otp.unwrap();
        let wrong = if code == "1000" { "1001" } else { "1000" };

        let err = start_with_otp(&state, driver, view.id, wrong).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let started = start_with_otp(&state, driver, view.id, &code).await.unwrap();
        assert_eq!(started.status, RideStatus::InProgress);

        let replay = start_with_otp(&state, driver, view.id, &code).await.unwrap_err();
        assert!(matches!(replay, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn complete_before_start_is_rejected() {
        let state = test_state();
        let view = create_request(&state, rider(), request()).await.unwrap();
        let driver = driver(&state).await;
        accept(&state, driver, view.id).await.unwrap();

        let err = complete(&state, driver, view.id).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(msg) if msg == "cannot complete ride"));
    }

    #[tokio::test]
    async fn only_the_rider_cancels_and_never_twice() {
        let state = test_state();
        let rider = rider();
        let view = create_request(&state, rider, request()).await.unwrap();
        let driver = driver(&state).await;

        let err = cancel(&state, driver, view.id).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let cancelled = cancel(&state, rider, view.id).await.unwrap();
        assert_eq!(cancelled.status, RideStatus::Cancelled);
        assert!(!state.pending.contains(&view.id));

        let again = cancel(&state, rider, view.id).await.unwrap_err();
        assert!(matches!(again, AppError::Conflict(msg) if msg == "ride cannot be cancelled"));
    }

    #[tokio::test]
    async fn rating_requires_completion_and_is_write_once() {
        let state = test_state();
        let rider = rider();
        let view = create_request(&state, rider, request()).await.unwrap();
        let driver = driver(&state).await;
        accept(&state, driver, view.id).await.unwrap();

        let early = rate(
            &state,
            rider,
            view.id,
            RateRideRequest {
                rating: 4,
                feedback: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(early, AppError::Conflict(_)));

        let code = get_active(&state, rider).await.unwrap().otp.unwrap();
        start_with_otp(&state, driver, view.id, &code).await.unwrap();
        complete(&state, driver, view.id).await.unwrap();

        let rated = rate(
            &state,
            rider,
            view.id,
            RateRideRequest {
                rating: 4,
                feedback: Some("  smooth ride ".to_string()),
            },
        )
        .await
        .unwrap();
        assert_eq!(rated.rating, Some(4));
        assert_eq!(rated.feedback.as_deref(), Some("smooth ride"));

        let twice = rate(
            &state,
            rider,
            view.id,
            RateRideRequest {
                rating: 5,
                feedback: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(twice, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn no_active_ride_is_not_found() {
        let state = test_state();
        let err = get_active(&state, rider()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn outsiders_cannot_read_a_ride() {
        let state = test_state();
        let view = create_request(&state, rider(), request()).await.unwrap();
        let err = get_ride(&state, rider(), view.id).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let admin = AuthUser {
            user_id: Uuid::new_v4(),
            role: Role::Admin,
        };
        assert_eq!(get_ride(&state, admin, view.id).await.unwrap().id, view.id);
    }
}
