use tracing::{debug, info};

use crate::auth::AuthUser;
use crate::engine::dispatch;
use crate::error::AppError;
use crate::geo::presence::{DEFAULT_LIMIT, DEFAULT_RADIUS_KM};
use crate::models::location::{GeoPoint, LocationUpdate, NearbyDriver, NearbyQuery};
use crate::models::ride::NearbyRide;
use crate::models::user::Role;
use crate::state::AppState;

const MAX_RADIUS_KM: f64 = 50.0;
const MAX_LIMIT: usize = 100;

/// Records a ping for the calling driver. The driver id is always the
/// authenticated caller.
pub fn update_location(
    state: &AppState,
    caller: AuthUser,
    update: &LocationUpdate,
) -> Result<(), AppError> {
    caller.require_role(&[Role::Driver])?;
    update.validate()?;

    state.presence.set_location(caller.user_id, update.location);
    debug!(
        driver = %caller.user_id,
        latitude = update.location.latitude,
        longitude = update.location.longitude,
        "location updated"
    );
    Ok(())
}

pub fn set_availability(state: &AppState, caller: AuthUser, available: bool) -> Result<(), AppError> {
    caller.require_role(&[Role::Driver])?;

    state.presence.set_availability(caller.user_id, available);
    info!(driver = %caller.user_id, available, "availability changed");
    Ok(())
}

pub fn nearby_drivers(state: &AppState, query: &NearbyQuery) -> Result<Vec<NearbyDriver>, AppError> {
    let center = query.point().ok_or_else(|| {
        AppError::BadRequest("latitude and longitude are required".to_string())
    })?;
    center.validate("location")?;
    let radius_km = radius(query)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    Ok(state.presence.find_nearby(&center, Some(radius_km), Some(limit)))
}

/// Waiting requests around the given point, or around the calling driver's
/// live position when the query carries no coordinates.
pub async fn nearby_rides(
    state: &AppState,
    caller: AuthUser,
    query: &NearbyQuery,
) -> Result<Vec<NearbyRide>, AppError> {
    caller.require_role(&[Role::Driver, Role::Admin])?;

    let center: GeoPoint = match query.point() {
        Some(point) => point,
        None if caller.is_driver() => state.presence.get_location(&caller.user_id)?,
        None => {
            return Err(AppError::BadRequest(
                "latitude and longitude are required".to_string(),
            ))
        }
    };
    center.validate("location")?;

    dispatch::find_nearby_rides(state, &center, radius(query)?).await
}

fn radius(query: &NearbyQuery) -> Result<f64, AppError> {
    let radius_km = query.radius_km.unwrap_or(DEFAULT_RADIUS_KM);
    if !radius_km.is_finite() || radius_km <= 0.0 || radius_km > MAX_RADIUS_KM {
        return Err(AppError::BadRequest(format!(
            "radius must be greater than 0 and at most {MAX_RADIUS_KM} km"
        )));
    }
    Ok(radius_km)
}
