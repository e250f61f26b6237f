use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

use super::{geohash, haversine_km};
use crate::models::location::GeoPoint;

#[derive(Debug, Clone, PartialEq)]
pub struct Hit<M> {
    pub member: M,
    pub distance_km: f64,
    pub point: GeoPoint,
}

/// Proximity index keyed by geohash. Radius queries walk at most nine
/// contiguous key ranges of the sorted map, then filter by true distance.
#[derive(Debug)]
pub struct GeoIndex<M> {
    cells: BTreeMap<u64, HashSet<M>>,
    members: HashMap<M, (u64, GeoPoint)>,
}

impl<M> Default for GeoIndex<M> {
    fn default() -> Self {
        Self {
            cells: BTreeMap::new(),
            members: HashMap::new(),
        }
    }
}

impl<M> GeoIndex<M>
where
    M: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn upsert(&mut self, member: M, point: GeoPoint) {
        let hash = geohash::encode(&point);
        if let Some((previous, _)) = self.members.insert(member, (hash, point)) {
            if previous == hash {
                return;
            }
            self.detach(previous, &member);
        }
        self.cells.entry(hash).or_default().insert(member);
    }

    pub fn remove(&mut self, member: &M) -> Option<GeoPoint> {
        let (hash, point) = self.members.remove(member)?;
        self.detach(hash, member);
        Some(point)
    }

    pub fn position(&self, member: &M) -> Option<GeoPoint> {
        self.members.get(member).map(|(_, point)| *point)
    }

    pub fn members(&self) -> impl Iterator<Item = M> + '_ {
        self.members.keys().copied()
    }

    /// Members within `radius_km` of `center`, nearest first.
    pub fn within(&self, center: &GeoPoint, radius_km: f64, limit: usize) -> Vec<Hit<M>> {
        if limit == 0 || radius_km.is_nan() || radius_km < 0.0 {
            return Vec::new();
        }

        let mut hits: Vec<Hit<M>> = geohash::covering_ranges(center, radius_km)
            .into_iter()
            .flat_map(|range| self.cells.range(range))
            .flat_map(|(_, members)| members.iter())
            .filter_map(|member| {
                let (_, point) = self.members.get(member)?;
                let distance_km = haversine_km(center, point);
                (distance_km <= radius_km).then_some(Hit {
                    member: *member,
                    distance_km,
                    point: *point,
                })
            })
            .collect();

        hits.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        hits.truncate(limit);
        hits
    }

    fn detach(&mut self, hash: u64, member: &M) {
        if let Some(bucket) = self.cells.get_mut(&hash) {
            bucket.remove(member);
            if bucket.is_empty() {
                self.cells.remove(&hash);
            }
        }
    }
}
