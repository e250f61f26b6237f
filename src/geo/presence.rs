use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use super::GeoIndex;
use crate::error::AppError;
use crate::models::location::{GeoPoint, NearbyDriver};

pub const DEFAULT_RADIUS_KM: f64 = 5.0;
pub const DEFAULT_LIMIT: usize = 20;

/// Live driver positions plus an online marker that lapses `ttl` after the
/// last ping. A driver whose marker lapsed is treated as offline even
/// before the sweep evicts them from the index.
pub struct Presence {
    index: RwLock<GeoIndex<Uuid>>,
    online: DashMap<Uuid, Instant>,
    ttl: Duration,
}

impl Presence {
    pub fn new(ttl: Duration) -> Self {
        Self {
            index: RwLock::new(GeoIndex::new()),
            online: DashMap::new(),
            ttl,
        }
    }

    pub fn set_location(&self, driver_id: Uuid, point: GeoPoint) {
        self.online.insert(driver_id, Instant::now() + self.ttl);
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .upsert(driver_id, point);
    }

    pub fn set_availability(&self, driver_id: Uuid, available: bool) {
        if available {
            self.online.insert(driver_id, Instant::now() + self.ttl);
            return;
        }
        self.online.remove(&driver_id);
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&driver_id);
    }

    pub fn is_online(&self, driver_id: &Uuid) -> bool {
        self.online
            .get(driver_id)
            .is_some_and(|expires_at| *expires_at > Instant::now())
    }

    pub fn find_nearby(
        &self,
        center: &GeoPoint,
        radius_km: Option<f64>,
        limit: Option<usize>,
    ) -> Vec<NearbyDriver> {
        let radius_km = radius_km.unwrap_or(DEFAULT_RADIUS_KM);
        let limit = limit.unwrap_or(DEFAULT_LIMIT);

        let hits = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .within(center, radius_km, usize::MAX);

        hits.into_iter()
            .filter(|hit| self.is_online(&hit.member))
            .take(limit)
            .map(|hit| NearbyDriver {
                id: hit.member,
                distance: hit.distance_km,
                latitude: hit.point.latitude,
                longitude: hit.point.longitude,
            })
            .collect()
    }

    pub fn get_location(&self, driver_id: &Uuid) -> Result<GeoPoint, AppError> {
        let position = if self.is_online(driver_id) {
            self.index
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .position(driver_id)
        } else {
            None
        };
        position.ok_or_else(|| AppError::NotFound("driver location not found".to_string()))
    }

    pub fn online_count(&self) -> usize {
        let now = Instant::now();
        self.online
            .iter()
            .filter(|entry| *entry.value() > now)
            .count()
    }

    /// Drops lapsed markers and their index entries. Returns how many
    /// drivers were evicted from the index.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        self.online.retain(|_, expires_at| *expires_at > now);

        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<Uuid> = index
            .members()
            .filter(|driver_id| !self.online.contains_key(driver_id))
            .collect();
        for driver_id in &stale {
            index.remove(driver_id);
        }

        stale.len()
    }
}
