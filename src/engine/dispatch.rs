use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::location::GeoPoint;
use crate::models::ride::{Audience, NearbyRide, Ride, RideStatus, RideView};
use crate::realtime::message::ServerEvent;
use crate::state::AppState;

pub const NEARBY_RIDES_LIMIT: usize = 20;
const FALLBACK_SCAN_LIMIT: usize = 1_000;

/// Fans a new request out to nearby online drivers without holding up the
/// caller. Delivery is best effort.
pub fn spawn_broadcast(state: Arc<AppState>, ride: Ride) {
    tokio::spawn(async move {
        broadcast_new_request(&state, &ride);
    });
}

pub fn broadcast_new_request(state: &AppState, ride: &Ride) -> usize {
    let drivers = state.presence.find_nearby(
        &ride.pickup_location,
        Some(state.config.broadcast_radius_km),
        Some(state.config.broadcast_limit),
    );

    let event = ServerEvent::NewRideRequest(RideView::render(ride, Audience::Driver, None));
    for driver in &drivers {
        state.hub.send_to_user(driver.id, &event);
    }

    state
        .metrics
        .dispatch_fanout_drivers
        .observe(drivers.len() as f64);
    if drivers.is_empty() {
        warn!(ride_id = %ride.id, "no online drivers near pickup");
    } else {
        info!(ride_id = %ride.id, drivers = drivers.len(), "ride request broadcast");
    }
    drivers.len()
}

/// Requested rides around `center`, nearest first. Served from the pending
/// index; the store is scanned only while the index holds nothing at all.
pub async fn find_nearby_rides(
    state: &AppState,
    center: &GeoPoint,
    radius_km: f64,
) -> Result<Vec<NearbyRide>, AppError> {
    if state.pending.is_empty() {
        return scan_requested_rides(state, center, radius_km).await;
    }

    let hits = state.pending.find(center, radius_km, NEARBY_RIDES_LIMIT);
    if hits.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = hits.iter().map(|hit| hit.member).collect();
    let mut rides: HashMap<Uuid, Ride> = state
        .store
        .get_rides(&ids)
        .await?
        .into_iter()
        .map(|ride| (ride.id, ride))
        .collect();

    let mut nearby = Vec::with_capacity(hits.len());
    for hit in hits {
        match rides.remove(&hit.member) {
            Some(ride) if ride.status == RideStatus::Requested => nearby.push(NearbyRide {
                ride: RideView::render(&ride, Audience::Driver, None),
                distance_to_pickup_km: hit.distance_km,
            }),
            _ => {
                debug!(ride_id = %hit.member, "dropping stale pending entry");
                state.pending.remove(&hit.member);
            }
        }
    }
    state.refresh_pending_gauge();
    Ok(nearby)
}

async fn scan_requested_rides(
    state: &AppState,
    center: &GeoPoint,
    radius_km: f64,
) -> Result<Vec<NearbyRide>, AppError> {
    let rides = state.store.requested_rides(FALLBACK_SCAN_LIMIT).await?;

    let mut nearby: Vec<NearbyRide> = rides
        .iter()
        .filter_map(|ride| {
            let distance = haversine_km(center, &ride.pickup_location);
            (distance <= radius_km).then(|| NearbyRide {
                ride: RideView::render(ride, Audience::Driver, None),
                distance_to_pickup_km: distance,
            })
        })
        .collect();
    nearby.sort_by(|a, b| a.distance_to_pickup_km.total_cmp(&b.distance_to_pickup_km));
    nearby.truncate(NEARBY_RIDES_LIMIT);
    Ok(nearby)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_requests: usize,
    pub reconciled_requests: usize,
    pub evicted_drivers: usize,
}

/// Reconciles the pending index against the store, expires rides that
/// waited past their deadline without a driver and evicts drivers whose
/// presence marker lapsed.
pub async fn sweep(state: &AppState) -> SweepReport {
    let mut report = SweepReport::default();

    let ids = state.pending.ride_ids();
    if !ids.is_empty() {
        match state.store.get_rides(&ids).await {
            Ok(rides) => {
                let waiting: HashMap<Uuid, Ride> = rides
                    .into_iter()
                    .filter(|ride| ride.status == RideStatus::Requested)
                    .map(|ride| (ride.id, ride))
                    .collect();
                for ride_id in ids.iter().filter(|id| !waiting.contains_key(id)) {
                    if state.pending.remove(ride_id) {
                        report.reconciled_requests += 1;
                    }
                }
                for ride_id in state.pending.due() {
                    if let Some(ride) = waiting.get(&ride_id) {
                        if expire_request(state, ride).await {
                            report.expired_requests += 1;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "pending index reconciliation failed");
            }
        }
    }

    report.evicted_drivers = state.presence.sweep_expired();
    state.refresh_gauges();
    report
}

/// Cancels a ride nobody accepted in time and tells the rider. Returns
/// false when the ride moved on first or the store write failed; a failed
/// write leaves the entry for the next sweep.
async fn expire_request(state: &AppState, ride: &Ride) -> bool {
    match state.store.expire_ride(ride.id, Utc::now()).await {
        Ok(Some(expired)) => {
            state.pending.remove(&expired.id);
            state.metrics.record_transition("expired");
            state.hub.send_to_user(
                expired.rider_id,
                &ServerEvent::RideCancelled(RideView::render(&expired, Audience::Rider, None)),
            );
            info!(ride_id = %expired.id, rider_id = %expired.rider_id, "unanswered ride request expired");
            true
        }
        Ok(None) => {
            debug!(ride_id = %ride.id, "overdue request left requested before expiry");
            state.pending.remove(&ride.id);
            false
        }
        Err(err) => {
            warn!(ride_id = %ride.id, error = %err, "could not expire ride request");
            false
        }
    }
}

pub async fn run_sweeper(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(state.config.sweep_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = state.config.sweep_interval.as_secs(), "sweeper started");

    loop {
        interval.tick().await;
        let report = sweep(&state).await;
        if report != SweepReport::default() {
            info!(
                expired_requests = report.expired_requests,
                reconciled_requests = report.reconciled_requests,
                evicted_drivers = report.evicted_drivers,
                "sweep finished"
            );
        }
    }
}
