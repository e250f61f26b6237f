//! Integer geohash used to keep the proximity index sorted by locality.
//!
//! A hash interleaves [`STEPS`] longitude bits with [`STEPS`] latitude bits,
//! longitude first, so every prefix of `2 * step` bits names a cell and all
//! points inside that cell occupy one contiguous key range.

use std::ops::Range;

use super::KM_PER_DEGREE;
use crate::models::location::GeoPoint;

/// Bits per axis at full precision (about 0.6 m of latitude per cell).
pub const STEPS: u8 = 26;

pub fn encode(point: &GeoPoint) -> u64 {
    let lat = quantize(point.latitude, -90.0, 90.0, STEPS);
    let lng = quantize(point.longitude, -180.0, 180.0, STEPS);
    interleave(lng, lat)
}

/// Key ranges that together cover every point within `radius_km` of
/// `center`. The caller still has to filter by true distance.
pub fn covering_ranges(center: &GeoPoint, radius_km: f64) -> Vec<Range<u64>> {
    let step = step_for_radius(center.latitude, radius_km);
    if step == 0 {
        return vec![0..1u64 << (2 * STEPS as u32)];
    }

    let cells = 1i64 << step;
    let lat_idx = i64::from(quantize(center.latitude, -90.0, 90.0, step));
    let lng_idx = i64::from(quantize(center.longitude, -180.0, 180.0, step));

    let mut prefixes: Vec<u64> = Vec::with_capacity(9);
    for d_lat in -1..=1 {
        let lat = lat_idx + d_lat;
        if !(0..cells).contains(&lat) {
            continue;
        }
        for d_lng in -1..=1 {
            let lng = (lng_idx + d_lng).rem_euclid(cells);
            prefixes.push(interleave(lng as u32, lat as u32));
        }
    }
    prefixes.sort_unstable();
    prefixes.dedup();

    let shift = 2 * u32::from(STEPS - step);
    prefixes
        .into_iter()
        .map(|prefix| (prefix << shift)..((prefix + 1) << shift))
        .collect()
}

/// Finest precision whose cells are at least `radius_km` wide on both axes,
/// so a 3x3 block of cells around the centre contains the whole circle.
/// Longitude width is measured at the poleward edge of the circle.
pub fn step_for_radius(latitude: f64, radius_km: f64) -> u8 {
    if !radius_km.is_finite() || radius_km <= 0.0 {
        return STEPS;
    }

    let radius_deg = radius_km / KM_PER_DEGREE;
    let edge_lat = (latitude.abs() + radius_deg).min(90.0);
    let lng_scale = edge_lat.to_radians().cos();

    let mut step = STEPS;
    while step > 0 {
        let cell_lat_km = 180.0 / f64::from(1u32 << step) * KM_PER_DEGREE;
        let cell_lng_km = 360.0 / f64::from(1u32 << step) * KM_PER_DEGREE * lng_scale;
        if cell_lat_km >= radius_km && cell_lng_km >= radius_km {
            break;
        }
        step -= 1;
    }
    step
}

fn quantize(value: f64, min: f64, max: f64, step: u8) -> u32 {
    let cells = 1u64 << step;
    let scaled = ((value - min) / (max - min) * cells as f64).floor();
    scaled.clamp(0.0, (cells - 1) as f64) as u32
}

fn interleave(lng: u32, lat: u32) -> u64 {
    (spread(lng) << 1) | spread(lat)
}

fn spread(value: u32) -> u64 {
    let mut x = u64::from(value);
    x = (x | (x << 16)) & 0x0000_FFFF_0000_FFFF;
    x = (x | (x << 8)) & 0x00FF_00FF_00FF_00FF;
    x = (x | (x << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    x = (x | (x << 1)) & 0x5555_5555_5555_5555;
    x
}
