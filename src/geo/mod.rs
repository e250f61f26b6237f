use crate::models::location::GeoPoint;

pub mod geohash;
pub mod index;
pub mod presence;

pub use index::{GeoIndex, Hit};
pub use presence::Presence;

pub const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Kilometres spanned by one degree of latitude.
pub const KM_PER_DEGREE: f64 = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lng = (b.longitude - a.longitude).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * central_angle
}

#[cfg(test)]
mod tests {
    use super::haversine_km;
    use crate::models::location::GeoPoint;

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint::new(12.9716, 77.5946);
        assert!(haversine_km(&p, &p) < 1e-9);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = GeoPoint::new(12.9716, 77.5946);
        let b = GeoPoint::new(12.9352, 77.6245);
        assert_eq!(haversine_km(&a, &b), haversine_km(&b, &a));
    }

    #[test]
    fn london_to_paris_is_around_343_km() {
        let london = GeoPoint::new(51.5074, -0.1278);
        let paris = GeoPoint::new(48.8566, 2.3522);
        let distance = haversine_km(&london, &paris);
        assert!((distance - 343.0).abs() < 5.0);
    }

    #[test]
    fn antipodes_do_not_produce_nan() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 180.0);
        let distance = haversine_km(&a, &b);
        assert!(distance.is_finite());
        assert!((distance - 20_015.0).abs() < 1.0);
    }
}
