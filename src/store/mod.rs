//! Durable persistence boundary.
//!
//! Every lifecycle write that depends on the current row state is either a
//! locked transaction (`accept_ride`) or a guarded conditional update whose
//! `None` result means no row matched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::driver::Driver;
use crate::models::payment::Payment;
use crate::models::ride::{PaymentStatus, Ride};
use crate::models::user::User;

pub mod error;
pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    NotNull,
    Check,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("constraint violation: {message}")]
    Constraint { kind: ConstraintKind, message: String },

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub const RIDE_UNAVAILABLE: &str = "ride is no longer available";
pub const RIDER_HAS_ACTIVE_RIDE: &str = "rider already has an active ride";
pub const DRIVER_HAS_ACTIVE_RIDE: &str = "driver already has an active ride";
pub const PAYMENT_EXISTS: &str = "payment already exists for this ride";

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn upsert_user(&self, user: User) -> StoreResult<User>;
    async fn get_user(&self, id: Uuid) -> StoreResult<User>;

    /// Conflict when the user already owns a driver profile.
    async fn create_driver(&self, driver: Driver) -> StoreResult<Driver>;
    async fn get_driver(&self, id: Uuid) -> StoreResult<Driver>;
    async fn get_driver_by_user(&self, user_id: Uuid) -> StoreResult<Driver>;
    /// Replaces the vehicle details of an existing profile.
    async fn update_driver(&self, driver: Driver) -> StoreResult<Driver>;
    /// Sets the driver rating to the mean of their rated rides (5.0 if none).
    async fn recompute_driver_rating(&self, driver_id: Uuid) -> StoreResult<f64>;

    /// Conflict when the rider already has a non-terminal ride.
    async fn insert_ride(&self, ride: Ride) -> StoreResult<Ride>;
    async fn get_ride(&self, id: Uuid) -> StoreResult<Ride>;
    /// Rides for the given ids, silently skipping ids that do not exist.
    async fn get_rides(&self, ids: &[Uuid]) -> StoreResult<Vec<Ride>>;

    /// Locks the ride, checks it is still `requested` and that the driver
    /// is free, then binds driver and OTP in one step.
    async fn accept_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        otp: String,
        now: DateTime<Utc>,
    ) -> StoreResult<Ride>;
    async fn start_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>>;
    async fn complete_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>>;
    async fn cancel_ride(
        &self,
        ride_id: Uuid,
        rider_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>>;
    /// Cancels a ride that is still `requested`; used when nobody accepted
    /// it in time.
    async fn expire_ride(&self, ride_id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Ride>>;
    async fn rate_ride(
        &self,
        ride_id: Uuid,
        rider_id: Uuid,
        rating: u8,
        feedback: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>>;

    async fn active_ride_for_rider(&self, rider_id: Uuid) -> StoreResult<Option<Ride>>;
    async fn active_ride_for_driver(&self, driver_id: Uuid) -> StoreResult<Option<Ride>>;
    /// Oldest `requested` rides first.
    async fn requested_rides(&self, limit: usize) -> StoreResult<Vec<Ride>>;
    async fn update_payment_status(
        &self,
        ride_id: Uuid,
        status: PaymentStatus,
        payment_id: Option<Uuid>,
    ) -> StoreResult<Ride>;

    /// Conflict when the ride already has a payment that has not failed.
    async fn insert_payment(&self, payment: Payment) -> StoreResult<Payment>;
    async fn get_payment(&self, id: Uuid) -> StoreResult<Payment>;
    /// Most recent payment recorded for the ride, if any.
    async fn payment_for_ride(&self, ride_id: Uuid) -> StoreResult<Option<Payment>>;
    /// Writes gateway fields and status, but only while the stored payment
    /// is still open. `None` when it is missing or already final.
    async fn update_payment(&self, payment: Payment) -> StoreResult<Option<Payment>>;
}
