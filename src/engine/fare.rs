use serde::Serialize;

use crate::geo::haversine_km;
use crate::models::location::GeoPoint;

const BASE_FARE: f64 = 30.0;
const PER_KM_RATE: f64 = 12.0;
const PER_MINUTE_RATE: f64 = 2.0;
const AVERAGE_SPEED_KMH: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FareEstimate {
    pub distance_km: f64,
    pub duration_minutes: u32,
    pub fare: f64,
}

pub fn estimate(pickup: &GeoPoint, dropoff: &GeoPoint) -> FareEstimate {
    let distance_km = calculate_distance(pickup, dropoff);
    let duration_minutes = estimate_duration(distance_km);
    FareEstimate {
        distance_km,
        duration_minutes,
        fare: calculate_fare(distance_km, duration_minutes),
    }
}

pub fn calculate_distance(pickup: &GeoPoint, dropoff: &GeoPoint) -> f64 {
    haversine_km(pickup, dropoff)
}

pub fn estimate_duration(distance_km: f64) -> u32 {
    (distance_km.max(0.0) / AVERAGE_SPEED_KMH * 60.0).ceil() as u32
}

pub fn calculate_fare(distance_km: f64, duration_minutes: u32) -> f64 {
    round2(BASE_FARE + distance_km * PER_KM_RATE + f64::from(duration_minutes) * PER_MINUTE_RATE)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
