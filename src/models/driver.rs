use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::ride::VehicleType;

/// Rating every driver starts with, and the value used when no ride has
/// been rated yet.
pub const DEFAULT_DRIVER_RATING: f64 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Driver {
    pub id: Uuid,
    pub user_id: Uuid,
    pub vehicle_type: VehicleType,
    pub vehicle_number: String,
    pub capacity: u8,
    pub rating: f64,
    pub total_rides: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDriverRequest {
    pub vehicle_type: VehicleType,
    pub vehicle_number: String,
    pub capacity: u8,
}

impl CreateDriverRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        let len = self.vehicle_number.trim().chars().count();
        if !(4..=20).contains(&len) {
            return Err(AppError::BadRequest(
                "vehicle_number must be between 4 and 20 characters".to_string(),
            ));
        }
        if self.capacity == 0 {
            return Err(AppError::BadRequest("capacity must be > 0".to_string()));
        }
        Ok(())
    }

    /// Copies the vehicle details onto an existing profile.
    pub fn apply_to(self, mut driver: Driver, now: DateTime<Utc>) -> Driver {
        driver.vehicle_type = self.vehicle_type;
        driver.vehicle_number = self.vehicle_number.trim().to_uppercase();
        driver.capacity = self.capacity;
        driver.updated_at = now;
        driver
    }

    pub fn into_driver(self, user_id: Uuid, now: DateTime<Utc>) -> Driver {
        Driver {
            id: Uuid::new_v4(),
            user_id,
            vehicle_type: self.vehicle_type,
            vehicle_number: self.vehicle_number.trim().to_uppercase(),
            capacity: self.capacity,
            rating: DEFAULT_DRIVER_RATING,
            total_rides: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Mean of the given ratings, or the default when there are none.
pub fn average_rating(ratings: &[u8]) -> f64 {
    if ratings.is_empty() {
        return DEFAULT_DRIVER_RATING;
    }
    let sum: u32 = ratings.iter().map(|r| u32::from(*r)).sum();
    f64::from(sum) / ratings.len() as f64
}
