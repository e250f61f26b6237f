use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::fare::FareEstimate;
use crate::error::AppError;
use crate::models::location::GeoPoint;
use crate::models::text_enum;

text_enum! {
    pub enum RideStatus {
        Requested => "requested",
        Accepted => "accepted",
        DriverArrived => "driver_arrived",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
    }
}

impl RideStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// States from which `start` may fire.
    pub fn is_startable(&self) -> bool {
        matches!(self, Self::Accepted | Self::DriverArrived)
    }

    /// States in which a driver is bound to the ride.
    pub fn occupies_driver(&self) -> bool {
        matches!(self, Self::Accepted | Self::DriverArrived | Self::InProgress)
    }
}

text_enum! {
    pub enum PaymentStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
    }
}

text_enum! {
    pub enum VehicleType {
        Bike => "bike",
        Auto => "auto",
        Sedan => "sedan",
        Suv => "suv",
    }
}

text_enum! {
    pub enum PaymentMethod {
        Cash => "cash",
        Upi => "upi",
        Card => "card",
        Wallet => "wallet",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ride {
    pub id: Uuid,
    pub rider_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub pickup_location: GeoPoint,
    pub pickup_address: String,
    pub dropoff_location: GeoPoint,
    pub dropoff_address: String,
    pub vehicle_type: VehicleType,
    pub payment_method: PaymentMethod,
    pub fare: f64,
    pub distance_km: f64,
    pub duration_minutes: u32,
    pub status: RideStatus,
    pub otp: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub payment_status: PaymentStatus,
    pub payment_id: Option<Uuid>,
    pub rating: Option<u8>,
    pub feedback: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Ride {
    pub fn new_request(
        rider_id: Uuid,
        request: &RideRequest,
        estimate: FareEstimate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            rider_id,
            driver_id: None,
            pickup_location: request.pickup_location,
            pickup_address: request.pickup_address.trim().to_string(),
            dropoff_location: request.dropoff_location,
            dropoff_address: request.dropoff_address.trim().to_string(),
            vehicle_type: request.vehicle_type,
            payment_method: request.payment_method,
            fare: estimate.fare,
            distance_km: estimate.distance_km,
            duration_minutes: estimate.duration_minutes,
            status: RideStatus::Requested,
            otp: None,
            requested_at: now,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            payment_status: PaymentStatus::Pending,
            payment_id: None,
            rating: None,
            feedback: None,
            updated_at: now,
        }
    }

    /// Latest lifecycle timestamp set so far. New transition timestamps are
    /// clamped to it so the sequence never runs backwards.
    pub fn last_transition_at(&self) -> DateTime<Utc> {
        [self.accepted_at, self.started_at, self.completed_at, self.cancelled_at]
            .into_iter()
            .flatten()
            .fold(self.requested_at, Ord::max)
    }
}

const ADDRESS_MIN_LEN: usize = 5;
const ADDRESS_MAX_LEN: usize = 500;
pub const FEEDBACK_MAX_LEN: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct RideRequest {
    pub pickup_location: GeoPoint,
    pub pickup_address: String,
    pub dropoff_location: GeoPoint,
    pub dropoff_address: String,
    pub vehicle_type: VehicleType,
    pub payment_method: PaymentMethod,
}

impl RideRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        self.pickup_location.validate("pickup_location")?;
        self.dropoff_location.validate("dropoff_location")?;
        validate_address("pickup_address", &self.pickup_address)?;
        validate_address("dropoff_address", &self.dropoff_address)?;
        Ok(())
    }
}

fn validate_address(field: &str, value: &str) -> Result<(), AppError> {
    let len = value.trim().chars().count();
    if !(ADDRESS_MIN_LEN..=ADDRESS_MAX_LEN).contains(&len) {
        return Err(AppError::BadRequest(format!(
            "{field} must be between {ADDRESS_MIN_LEN} and {ADDRESS_MAX_LEN} characters"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartRideRequest {
    pub otp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateRideRequest {
    pub rating: u8,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl RateRideRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if !(1..=5).contains(&self.rating) {
            return Err(AppError::BadRequest(
                "rating must be between 1 and 5".to_string(),
            ));
        }
        if let Some(feedback) = &self.feedback {
            if feedback.chars().count() > FEEDBACK_MAX_LEN {
                return Err(AppError::BadRequest(format!(
                    "feedback must be at most {FEEDBACK_MAX_LEN} characters"
                )));
            }
        }
        Ok(())
    }
}

/// Who a [`RideView`] is rendered for. Only the rider ever sees the OTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Rider,
    Driver,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverSummary {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub vehicle_type: VehicleType,
    pub vehicle_number: String,
    pub rating: f64,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RideView {
    pub id: Uuid,
    pub status: RideStatus,
    pub pickup_address: String,
    pub dropoff_address: String,
    pub pickup_location: GeoPoint,
    pub dropoff_location: GeoPoint,
    pub vehicle_type: VehicleType,
    pub payment_method: PaymentMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
    pub fare: f64,
    pub distance_km: f64,
    pub duration_minutes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<DriverSummary>,
    pub requested_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub payment_status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl RideView {
    pub fn render(ride: &Ride, audience: Audience, driver: Option<DriverSummary>) -> Self {
        let otp = match audience {
            Audience::Rider if ride.status.is_startable() => ride.otp.clone(),
            _ => None,
        };

        Self {
            id: ride.id,
            status: ride.status,
            pickup_address: ride.pickup_address.clone(),
            dropoff_address: ride.dropoff_address.clone(),
            pickup_location: ride.pickup_location,
            dropoff_location: ride.dropoff_location,
            vehicle_type: ride.vehicle_type,
            payment_method: ride.payment_method,
            otp,
            fare: ride.fare,
            distance_km: ride.distance_km,
            duration_minutes: ride.duration_minutes,
            driver,
            requested_at: ride.requested_at,
            accepted_at: ride.accepted_at,
            started_at: ride.started_at,
            completed_at: ride.completed_at,
            cancelled_at: ride.cancelled_at,
            payment_status: ride.payment_status,
            rating: ride.rating,
            feedback: ride.feedback.clone(),
        }
    }
}

/// A waiting request as shown to a driver looking for work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NearbyRide {
    #[serde(flatten)]
    pub ride: RideView,
    pub distance_to_pickup_km: f64,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::engine::fare;

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

    #[test]
    fn status_text_round_trips_through_from_str() {
        for status in [
            RideStatus::Requested,
            RideStatus::Accepted,
            RideStatus::DriverArrived,
            RideStatus::InProgress,
            RideStatus::Completed,
            RideStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RideStatus>(), Ok(status));
        }
        assert!("finished".parse::<RideStatus>().is_err());
    }

    #[test]
    fn status_serializes_in_snake_case() {
        let json = serde_json::to_string(&RideStatus::DriverArrived).unwrap();
        assert_eq!(json, "\"driver_arrived\"");
    }

    #[test]
    fn short_address_is_rejected() {
        let mut req = request();
        req.dropoff_address = "abc".to_string();
        assert!(matches!(req.validate(), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn out_of_range_latitude_is_rejected() {
        let mut req = request();
        req.pickup_location.latitude = 91.0;
        assert!(matches!(req.validate(), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn rating_bounds_and_feedback_length_are_enforced() {
        let ok = RateRideRequest {
            rating: 5,
            feedback: Some("great".to_string()),
        };
        assert!(ok.validate().is_ok());

        let zero = RateRideRequest {
            rating: 0,
            feedback: None,
        };
        assert!(zero.validate().is_err());

        let long = RateRideRequest {
            rating: 3,
            feedback: Some("x".repeat(FEEDBACK_MAX_LEN + 1)),
        };
        assert!(long.validate().is_err());
    }

    #[test]
    fn otp_is_only_rendered_for_rider_before_start() {
        let estimate = fare::estimate(&request().pickup_location, &request().dropoff_location);
        let mut ride = Ride::new_request(Uuid::new_v4(), &request(), estimate, Utc::now());
        ride.status = RideStatus::Accepted;
        ride.otp = Some("4821".to_string());

        assert_eq!(
            RideView::render(&ride, Audience::Rider, None).otp.as_deref(),
            Some("4821")
        );
        assert_eq!(RideView::render(&ride, Audience::Driver, None).otp, None);

        ride.status = RideStatus::InProgress;
        assert_eq!(RideView::render(&ride, Audience::Rider, None).otp, None);
    }

    #[test]
    fn last_transition_tracks_latest_timestamp() {
        let now = Utc::now();
        let estimate = fare::estimate(&request().pickup_location, &request().dropoff_location);
        let mut ride = Ride::new_request(Uuid::new_v4(), &request(), estimate, now);
        assert_eq!(ride.last_transition_at(), now);

        ride.accepted_at = Some(now + Duration::seconds(5));
        ride.started_at = Some(now + Duration::seconds(9));
        assert_eq!(ride.last_transition_at(), now + Duration::seconds(9));
    }
}
