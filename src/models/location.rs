use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn validate(&self, field: &str) -> Result<(), AppError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(AppError::BadRequest(format!(
                "{field}.latitude must be between -90 and 90"
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(AppError::BadRequest(format!(
                "{field}.longitude must be between -180 and 180"
            )));
        }
        Ok(())
    }
}

/// A location ping from a driver. The driver is always the authenticated
/// caller; any `driver_id` a client puts in the payload is ignored.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LocationUpdate {
    pub location: GeoPoint,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
}

impl LocationUpdate {
    pub fn validate(&self) -> Result<(), AppError> {
        self.location.validate("location")?;
        if let Some(heading) = self.heading {
            if !(0.0..=360.0).contains(&heading) {
                return Err(AppError::BadRequest(
                    "heading must be between 0 and 360".to_string(),
                ));
            }
        }
        if let Some(speed) = self.speed {
            if speed < 0.0 {
                return Err(AppError::BadRequest("speed must be >= 0".to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NearbyDriver {
    pub id: Uuid,
    pub distance: f64,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NearbyQuery {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(alias = "radius")]
    pub radius_km: Option<f64>,
    pub limit: Option<usize>,
}

impl NearbyQuery {
    pub fn point(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint::new(latitude, longitude)),
            _ => None,
        }
    }
}
