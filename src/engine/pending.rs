use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::geo::{GeoIndex, Hit};
use crate::models::location::GeoPoint;

#[derive(Default)]
struct Entries {
    index: GeoIndex<Uuid>,
    deadlines: HashMap<Uuid, Instant>,
}

/// Pickup points of rides still waiting for a driver.
///
/// Every entry stays visible until it is removed; callers refilter hits
/// against the store. Each entry also carries a deadline `ttl` after
/// registration, after which [`PendingRequests::due`] reports it so the
/// sweeper can expire the ride.
pub struct PendingRequests {
    entries: RwLock<Entries>,
    ttl: Duration,
}

impl PendingRequests {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            ttl,
        }
    }

    pub fn register(&self, ride_id: Uuid, pickup: GeoPoint) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.index.upsert(ride_id, pickup);
        entries.deadlines.insert(ride_id, Instant::now() + self.ttl);
    }

    pub fn remove(&self, ride_id: &Uuid) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.deadlines.remove(ride_id);
        entries.index.remove(ride_id).is_some()
    }

    pub fn contains(&self, ride_id: &Uuid) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .deadlines
            .contains_key(ride_id)
    }

    pub fn find(&self, center: &GeoPoint, radius_km: f64, limit: usize) -> Vec<Hit<Uuid>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .index
            .within(center, radius_km, limit)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .deadlines
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ride_ids(&self) -> Vec<Uuid> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .deadlines
            .keys()
            .copied()
            .collect()
    }

    /// Rides whose deadline has passed. Entries are left in place.
    pub fn due(&self) -> Vec<Uuid> {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(ride_id, _)| *ride_id)
            .collect()
    }
}
