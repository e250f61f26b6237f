use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::{
    ConstraintKind, Store, StoreError, StoreResult, DRIVER_HAS_ACTIVE_RIDE, PAYMENT_EXISTS,
    RIDER_HAS_ACTIVE_RIDE, RIDE_UNAVAILABLE,
};
use crate::models::driver::{average_rating, Driver};
use crate::models::payment::{Payment, PaymentState};
use crate::models::ride::{PaymentStatus, Ride, RideStatus};
use crate::models::user::User;

/// In-process store backed by `DashMap` tables.
///
/// `active_by_rider` and `active_by_driver` hold the id of the single
/// non-terminal ride per party and play the role of partial unique indexes.
/// A ride's map guard is the row lock: index maps are only ever touched
/// while holding it, or with no ride guard held at all. `open_payments`
/// maps a ride to its payment that has not failed; it is never touched
/// while a payment guard is held.
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    drivers: DashMap<Uuid, Driver>,
    drivers_by_user: DashMap<Uuid, Uuid>,
    rides: DashMap<Uuid, Ride>,
    active_by_rider: DashMap<Uuid, Uuid>,
    active_by_driver: DashMap<Uuid, Uuid>,
    payments: DashMap<Uuid, Payment>,
    open_payments: DashMap<Uuid, Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn release_indexes(&self, ride: &Ride) {
        self.active_by_rider
            .remove_if(&ride.rider_id, |_, active| *active == ride.id);
        if let Some(driver_id) = ride.driver_id {
            self.active_by_driver
                .remove_if(&driver_id, |_, active| *active == ride.id);
        }
    }

    fn active_ride(&self, index: &DashMap<Uuid, Uuid>, party: Uuid) -> Option<Ride> {
        let ride_id = index.get(&party).map(|entry| *entry.value())?;
        self.rides
            .get(&ride_id)
            .map(|ride| ride.clone())
            .filter(|ride| !ride.status.is_terminal())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_user(&self, user: User) -> StoreResult<User> {
        let stored = match self.users.entry(user.id) {
            Entry::Occupied(mut existing) => {
                let current = existing.get_mut();
                current.name = user.name;
                current.phone = user.phone;
                current.updated_at = user.updated_at;
                current.clone()
            }
            Entry::Vacant(slot) => slot.insert(user).clone(),
        };
        Ok(stored)
    }

    async fn get_user(&self, id: Uuid) -> StoreResult<User> {
        self.users
            .get(&id)
            .map(|user| user.clone())
            .ok_or_else(|| StoreError::not_found("user", id))
    }

    async fn create_driver(&self, driver: Driver) -> StoreResult<Driver> {
        match self.drivers_by_user.entry(driver.user_id) {
            Entry::Occupied(_) => {
                return Err(StoreError::Conflict(
                    "driver profile already exists".to_string(),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(driver.id);
            }
        }
        self.drivers.insert(driver.id, driver.clone());
        Ok(driver)
    }

    async fn get_driver(&self, id: Uuid) -> StoreResult<Driver> {
        self.drivers
            .get(&id)
            .map(|driver| driver.clone())
            .ok_or_else(|| StoreError::not_found("driver", id))
    }

    async fn get_driver_by_user(&self, user_id: Uuid) -> StoreResult<Driver> {
        let driver_id = self
            .drivers_by_user
            .get(&user_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| StoreError::not_found("driver profile", user_id))?;
        self.get_driver(driver_id).await
    }

    async fn update_driver(&self, driver: Driver) -> StoreResult<Driver> {
        let mut stored = self
            .drivers
            .get_mut(&driver.id)
            .ok_or_else(|| StoreError::not_found("driver", driver.id))?;
        stored.vehicle_type = driver.vehicle_type;
        stored.vehicle_number = driver.vehicle_number;
        stored.capacity = driver.capacity;
        stored.updated_at = driver.updated_at;
        Ok(stored.clone())
    }

    async fn recompute_driver_rating(&self, driver_id: Uuid) -> StoreResult<f64> {
        let ratings: Vec<u8> = self
            .rides
            .iter()
            .filter(|ride| ride.driver_id == Some(driver_id))
            .filter_map(|ride| ride.rating)
            .collect();
        let rating = average_rating(&ratings);

        let mut driver = self
            .drivers
            .get_mut(&driver_id)
            .ok_or_else(|| StoreError::not_found("driver", driver_id))?;
        driver.rating = rating;
        driver.updated_at = Utc::now();
        Ok(rating)
    }

    async fn insert_ride(&self, ride: Ride) -> StoreResult<Ride> {
        if self.rides.contains_key(&ride.id) {
            return Err(StoreError::Conflict(
                "A Ride with this identifier already exists".to_string(),
            ));
        }

        match self.active_by_rider.entry(ride.rider_id) {
            Entry::Occupied(_) => {
                return Err(StoreError::Conflict(RIDER_HAS_ACTIVE_RIDE.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(ride.id);
            }
        }

        self.rides.insert(ride.id, ride.clone());
        Ok(ride)
    }

    async fn get_ride(&self, id: Uuid) -> StoreResult<Ride> {
        self.rides
            .get(&id)
            .map(|ride| ride.clone())
            .ok_or_else(|| StoreError::not_found("ride", id))
    }

    async fn get_rides(&self, ids: &[Uuid]) -> StoreResult<Vec<Ride>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.rides.get(id).map(|ride| ride.clone()))
            .collect())
    }

    async fn accept_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        otp: String,
        now: DateTime<Utc>,
    ) -> StoreResult<Ride> {
        let mut ride = self
            .rides
            .get_mut(&ride_id)
            .ok_or_else(|| StoreError::not_found("ride", ride_id))?;

        if ride.status != RideStatus::Requested {
            return Err(StoreError::Conflict(RIDE_UNAVAILABLE.to_string()));
        }

        match self.active_by_driver.entry(driver_id) {
            Entry::Occupied(_) => {
                return Err(StoreError::Conflict(DRIVER_HAS_ACTIVE_RIDE.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(ride_id);
            }
        }

        let at = now.max(ride.last_transition_at());
        ride.driver_id = Some(driver_id);
        ride.status = RideStatus::Accepted;
        ride.otp = Some(otp);
        ride.accepted_at = Some(at);
        ride.updated_at = at;
        Ok(ride.clone())
    }

    async fn start_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>> {
        let Some(mut ride) = self.rides.get_mut(&ride_id) else {
            return Ok(None);
        };
        if ride.driver_id != Some(driver_id) || !ride.status.is_startable() {
            return Ok(None);
        }

        let at = now.max(ride.last_transition_at());
        ride.status = RideStatus::InProgress;
        ride.started_at = Some(at);
        ride.updated_at = at;
        Ok(Some(ride.clone()))
    }

    async fn complete_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>> {
        let completed = {
            let Some(mut ride) = self.rides.get_mut(&ride_id) else {
                return Ok(None);
            };
            if ride.driver_id != Some(driver_id) || ride.status != RideStatus::InProgress {
                return Ok(None);
            }

            let at = now.max(ride.last_transition_at());
            ride.status = RideStatus::Completed;
            ride.completed_at = Some(at);
            ride.updated_at = at;
            self.release_indexes(&ride);
            ride.clone()
        };

        if let Some(mut driver) = self.drivers.get_mut(&driver_id) {
            driver.total_rides += 1;
            driver.updated_at = completed.updated_at;
        }
        Ok(Some(completed))
    }

    async fn cancel_ride(
        &self,
        ride_id: Uuid,
        rider_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>> {
        let Some(mut ride) = self.rides.get_mut(&ride_id) else {
            return Ok(None);
        };
        if ride.rider_id != rider_id || ride.status.is_terminal() {
            return Ok(None);
        }

        let at = now.max(ride.last_transition_at());
        ride.status = RideStatus::Cancelled;
        ride.cancelled_at = Some(at);
        ride.updated_at = at;
        self.release_indexes(&ride);
        Ok(Some(ride.clone()))
    }

    async fn expire_ride(&self, ride_id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Ride>> {
        let Some(mut ride) = self.rides.get_mut(&ride_id) else {
            return Ok(None);
        };
        if ride.status != RideStatus::Requested {
            return Ok(None);
        }

        let at = now.max(ride.last_transition_at());
        ride.status = RideStatus::Cancelled;
        ride.cancelled_at = Some(at);
        ride.updated_at = at;
        self.release_indexes(&ride);
        Ok(Some(ride.clone()))
    }

    async fn rate_ride(
        &self,
        ride_id: Uuid,
        rider_id: Uuid,
        rating: u8,
        feedback: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>> {
        let Some(mut ride) = self.rides.get_mut(&ride_id) else {
            return Ok(None);
        };
        if ride.rider_id != rider_id
            || ride.status != RideStatus::Completed
            || ride.rating.is_some()
        {
            return Ok(None);
        }

        ride.rating = Some(rating);
        ride.feedback = feedback;
        ride.updated_at = now.max(ride.updated_at);
        Ok(Some(ride.clone()))
    }

    async fn active_ride_for_rider(&self, rider_id: Uuid) -> StoreResult<Option<Ride>> {
        Ok(self.active_ride(&self.active_by_rider, rider_id))
    }

    async fn active_ride_for_driver(&self, driver_id: Uuid) -> StoreResult<Option<Ride>> {
        Ok(self.active_ride(&self.active_by_driver, driver_id))
    }

    async fn requested_rides(&self, limit: usize) -> StoreResult<Vec<Ride>> {
        let mut rides: Vec<Ride> = self
            .rides
            .iter()
            .filter(|ride| ride.status == RideStatus::Requested)
            .map(|ride| ride.clone())
            .collect();
        rides.sort_by_key(|ride| ride.requested_at);
        rides.truncate(limit);
        Ok(rides)
    }

    async fn update_payment_status(
        &self,
        ride_id: Uuid,
        status: PaymentStatus,
        payment_id: Option<Uuid>,
    ) -> StoreResult<Ride> {
        let mut ride = self
            .rides
            .get_mut(&ride_id)
            .ok_or_else(|| StoreError::not_found("ride", ride_id))?;
        ride.payment_status = status;
        if payment_id.is_some() {
            ride.payment_id = payment_id;
        }
        ride.updated_at = Utc::now().max(ride.updated_at);
        Ok(ride.clone())
    }

    async fn insert_payment(&self, payment: Payment) -> StoreResult<Payment> {
        if !self.rides.contains_key(&payment.ride_id) {
            return Err(StoreError::Constraint {
                kind: ConstraintKind::ForeignKey,
                message: "The referenced Ride does not exist".to_string(),
            });
        }
        if self.payments.contains_key(&payment.id) {
            return Err(StoreError::Conflict(
                "A Payment with this identifier already exists".to_string(),
            ));
        }

        if payment.status != PaymentState::Failed {
            match self.open_payments.entry(payment.ride_id) {
                Entry::Occupied(_) => {
                    return Err(StoreError::Conflict(PAYMENT_EXISTS.to_string()));
                }
                Entry::Vacant(slot) => {
                    slot.insert(payment.id);
                }
            }
        }
        self.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Payment> {
        self.payments
            .get(&id)
            .map(|payment| payment.clone())
            .ok_or_else(|| StoreError::not_found("payment", id))
    }

    async fn payment_for_ride(&self, ride_id: Uuid) -> StoreResult<Option<Payment>> {
        Ok(self
            .payments
            .iter()
            .filter(|payment| payment.ride_id == ride_id)
            .max_by_key(|payment| payment.created_at)
            .map(|payment| payment.clone()))
    }

    async fn update_payment(&self, payment: Payment) -> StoreResult<Option<Payment>> {
        let updated = {
            let Some(mut stored) = self.payments.get_mut(&payment.id) else {
                return Ok(None);
            };
            if !stored.status.is_open() {
                return Ok(None);
            }
            stored.gateway_order_id = payment.gateway_order_id;
            stored.gateway_payment_id = payment.gateway_payment_id;
            stored.gateway_signature = payment.gateway_signature;
            stored.status = payment.status;
            stored.updated_at = payment.updated_at;
            stored.clone()
        };

        if updated.status == PaymentState::Failed {
            self.open_payments
                .remove_if(&updated.ride_id, |_, open| *open == updated.id);
        }
        Ok(Some(updated))
    }
}
