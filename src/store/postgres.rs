//! Postgres-backed [`Store`].
//!
//! Queries are built at runtime so the crate compiles without a live
//! database. The one-active-ride rules are enforced twice: by explicit
//! checks inside `accept_ride`'s transaction and by the partial unique
//! indexes in `migrations/`, which also close the create-request race.
//! The same kind of index keeps a ride to one payment that has not failed.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{
    Store, StoreError, StoreResult, DRIVER_HAS_ACTIVE_RIDE, RIDE_UNAVAILABLE,
};
use crate::models::driver::Driver;
use crate::models::location::GeoPoint;
use crate::models::payment::Payment;
use crate::models::ride::{PaymentStatus, Ride};
use crate::models::user::User;

const ACTIVE_STATUSES: &str = "('requested', 'accepted', 'driver_arrived', 'in_progress')";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Database(format!("migration failed: {err}")))
    }

    /// Runs a guarded `UPDATE ... RETURNING *` bound to `(ride, party, now)`.
    async fn ride_update(
        &self,
        sql: &str,
        ride_id: Uuid,
        party: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>> {
        sqlx::query_as::<_, RideRow>(sql)
            .bind(ride_id)
            .bind(party)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .map(Ride::try_from)
            .transpose()
    }
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    phone: Option<String>,
    role: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> StoreResult<Self> {
        Ok(User {
            id: row.id,
            name: row.name,
            phone: row.phone,
            role: parse_text("users.role", &row.role)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct DriverRow {
    id: Uuid,
    user_id: Uuid,
    vehicle_type: String,
    vehicle_number: String,
    capacity: i16,
    rating: f64,
    total_rides: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DriverRow> for Driver {
    type Error = StoreError;

    fn try_from(row: DriverRow) -> StoreResult<Self> {
        Ok(Driver {
            id: row.id,
            user_id: row.user_id,
            vehicle_type: parse_text("drivers.vehicle_type", &row.vehicle_type)?,
            vehicle_number: row.vehicle_number,
            capacity: narrow("drivers.capacity", row.capacity)?,
            rating: row.rating,
            total_rides: narrow("drivers.total_rides", row.total_rides)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct RideRow {
    id: Uuid,
    rider_id: Uuid,
    driver_id: Option<Uuid>,
    pickup_latitude: f64,
    pickup_longitude: f64,
    pickup_address: String,
    dropoff_latitude: f64,
    dropoff_longitude: f64,
    dropoff_address: String,
    vehicle_type: String,
    payment_method: String,
    fare: f64,
    distance_km: f64,
    duration_minutes: i32,
    status: String,
    otp: Option<String>,
    requested_at: DateTime<Utc>,
    accepted_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    payment_status: String,
    payment_id: Option<Uuid>,
    rating: Option<i16>,
    feedback: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RideRow> for Ride {
    type Error = StoreError;

    fn try_from(row: RideRow) -> StoreResult<Self> {
        Ok(Ride {
            id: row.id,
            rider_id: row.rider_id,
            driver_id: row.driver_id,
            pickup_location: GeoPoint::new(row.pickup_latitude, row.pickup_longitude),
            pickup_address: row.pickup_address,
            dropoff_location: GeoPoint::new(row.dropoff_latitude, row.dropoff_longitude),
            dropoff_address: row.dropoff_address,
            vehicle_type: parse_text("rides.vehicle_type", &row.vehicle_type)?,
            payment_method: parse_text("rides.payment_method", &row.payment_method)?,
            fare: row.fare,
            distance_km: row.distance_km,
            duration_minutes: narrow("rides.duration_minutes", row.duration_minutes)?,
            status: parse_text("rides.status", &row.status)?,
            otp: row.otp,
            requested_at: row.requested_at,
            accepted_at: row.accepted_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
            payment_status: parse_text("rides.payment_status", &row.payment_status)?,
            payment_id: row.payment_id,
            rating: row
                .rating
                .map(|rating| narrow("rides.rating", rating))
                .transpose()?,
            feedback: row.feedback,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid,
    ride_id: Uuid,
    rider_id: Uuid,
    amount: f64,
    currency: String,
    gateway_order_id: Option<String>,
    gateway_payment_id: Option<String>,
    gateway_signature: Option<String>,
    status: String,
    payment_method: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> StoreResult<Self> {
        Ok(Payment {
            id: row.id,
            ride_id: row.ride_id,
            rider_id: row.rider_id,
            amount: row.amount,
            currency: row.currency,
            gateway_order_id: row.gateway_order_id,
            gateway_payment_id: row.gateway_payment_id,
            gateway_signature: row.gateway_signature,
            status: parse_text("payments.status", &row.status)?,
            payment_method: parse_text("payments.payment_method", &row.payment_method)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_text<T>(column: &str, raw: &str) -> StoreResult<T>
where
    T: FromStr<Err = String>,
{
    raw.parse()
        .map_err(|err| StoreError::Database(format!("{column}: {err}")))
}

fn narrow<S, T>(column: &str, value: S) -> StoreResult<T>
where
    S: Copy + std::fmt::Display,
    T: TryFrom<S>,
{
    T::try_from(value)
        .map_err(|_| StoreError::Database(format!("{column}: value {value} out of range")))
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_user(&self, user: User) -> StoreResult<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (id, name, phone, role, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
                SET name = EXCLUDED.name,
                    phone = EXCLUDED.phone,
                    updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.phone)
        .bind(user.role.as_str())
        .bind(user.created_at)
        .bind(user.updated_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_user(&self, id: Uuid) -> StoreResult<User> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("user", id))?
            .try_into()
    }

    async fn create_driver(&self, driver: Driver) -> StoreResult<Driver> {
        let row = sqlx::query_as::<_, DriverRow>(
            r#"
            INSERT INTO drivers
                (id, user_id, vehicle_type, vehicle_number, capacity, rating,
                 total_rides, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(driver.id)
        .bind(driver.user_id)
        .bind(driver.vehicle_type.as_str())
        .bind(&driver.vehicle_number)
        .bind(i16::from(driver.capacity))
        .bind(driver.rating)
        .bind(i32::try_from(driver.total_rides).unwrap_or(i32::MAX))
        .bind(driver.created_at)
        .bind(driver.updated_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_driver(&self, id: Uuid) -> StoreResult<Driver> {
        sqlx::query_as::<_, DriverRow>("SELECT * FROM drivers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("driver", id))?
            .try_into()
    }

    async fn get_driver_by_user(&self, user_id: Uuid) -> StoreResult<Driver> {
        sqlx::query_as::<_, DriverRow>("SELECT * FROM drivers WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("driver profile", user_id))?
            .try_into()
    }

    async fn update_driver(&self, driver: Driver) -> StoreResult<Driver> {
        sqlx::query_as::<_, DriverRow>(
            r#"
            UPDATE drivers
            SET vehicle_type = $2,
                vehicle_number = $3,
                capacity = $4,
                updated_at = $5
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(driver.id)
        .bind(driver.vehicle_type.as_str())
        .bind(&driver.vehicle_number)
        .bind(i16::from(driver.capacity))
        .bind(driver.updated_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("driver", driver.id))?
        .try_into()
    }

    async fn recompute_driver_rating(&self, driver_id: Uuid) -> StoreResult<f64> {
        let rating: Option<(f64,)> = sqlx::query_as(
            r#"
            UPDATE drivers
            SET rating = COALESCE(
                    (SELECT AVG(rating)::DOUBLE PRECISION
                     FROM rides
                     WHERE driver_id = $1 AND rating IS NOT NULL),
                    5.0),
                updated_at = now()
            WHERE id = $1
            RETURNING rating
            "#,
        )
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await?;
        rating
            .map(|(rating,)| rating)
            .ok_or_else(|| StoreError::not_found("driver", driver_id))
    }

    async fn insert_ride(&self, ride: Ride) -> StoreResult<Ride> {
        let row = sqlx::query_as::<_, RideRow>(
            r#"
            INSERT INTO rides
                (id, rider_id, driver_id,
                 pickup_latitude, pickup_longitude, pickup_address,
                 dropoff_latitude, dropoff_longitude, dropoff_address,
                 vehicle_type, payment_method, fare, distance_km, duration_minutes,
                 status, otp, requested_at, payment_status, updated_at)
            VALUES ($1, $2, NULL, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, NULL, $15, $16, $15)
            RETURNING *
            "#,
        )
        .bind(ride.id)
        .bind(ride.rider_id)
        .bind(ride.pickup_location.latitude)
        .bind(ride.pickup_location.longitude)
        .bind(&ride.pickup_address)
        .bind(ride.dropoff_location.latitude)
        .bind(ride.dropoff_location.longitude)
        .bind(&ride.dropoff_address)
        .bind(ride.vehicle_type.as_str())
        .bind(ride.payment_method.as_str())
        .bind(ride.fare)
        .bind(ride.distance_km)
        .bind(i32::try_from(ride.duration_minutes).unwrap_or(i32::MAX))
        .bind(ride.status.as_str())
        .bind(ride.requested_at)
        .bind(ride.payment_status.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_ride(&self, id: Uuid) -> StoreResult<Ride> {
        sqlx::query_as::<_, RideRow>("SELECT * FROM rides WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("ride", id))?
            .try_into()
    }

    async fn get_rides(&self, ids: &[Uuid]) -> StoreResult<Vec<Ride>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, RideRow>("SELECT * FROM rides WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Ride::try_from)
            .collect()
    }

    async fn accept_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        otp: String,
        now: DateTime<Utc>,
    ) -> StoreResult<Ride> {
        let mut tx = self.pool.begin().await?;

        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM rides WHERE id = $1 FOR UPDATE")
                .bind(ride_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (status,) = status.ok_or_else(|| StoreError::not_found("ride", ride_id))?;
        if status != "requested" {
            return Err(StoreError::Conflict(RIDE_UNAVAILABLE.to_string()));
        }

        let (busy,): (bool,) = sqlx::query_as(&format!(
            "SELECT EXISTS (SELECT 1 FROM rides WHERE driver_id = $1 AND status IN {ACTIVE_STATUSES})"
        ))
        .bind(driver_id)
        .fetch_one(&mut *tx)
        .await?;
        if busy {
            return Err(StoreError::Conflict(DRIVER_HAS_ACTIVE_RIDE.to_string()));
        }

        let row = sqlx::query_as::<_, RideRow>(
            r#"
            UPDATE rides
            SET driver_id = $2,
                status = 'accepted',
                otp = $3,
                accepted_at = GREATEST($4, requested_at),
                updated_at = GREATEST($4, requested_at)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(ride_id)
        .bind(driver_id)
        .bind(&otp)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn start_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>> {
        self.ride_update(
            r#"
            UPDATE rides
            SET status = 'in_progress',
                started_at = GREATEST($3, requested_at, accepted_at),
                updated_at = GREATEST($3, requested_at, accepted_at)
            WHERE id = $1
              AND driver_id = $2
              AND status IN ('accepted', 'driver_arrived')
            RETURNING *
            "#,
            ride_id,
            driver_id,
            now,
        )
        .await
    }

    async fn complete_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>> {
        self.ride_update(
            r#"
            WITH completed AS (
                UPDATE rides
                SET status = 'completed',
                    completed_at = GREATEST($3, requested_at, accepted_at, started_at),
                    updated_at = GREATEST($3, requested_at, accepted_at, started_at)
                WHERE id = $1
                  AND driver_id = $2
                  AND status = 'in_progress'
                RETURNING *
            ), counted AS (
                UPDATE drivers
                SET total_rides = total_rides + 1,
                    updated_at = $3
                WHERE id IN (SELECT driver_id FROM completed)
            )
            SELECT * FROM completed
            "#,
            ride_id,
            driver_id,
            now,
        )
        .await
    }

    async fn cancel_ride(
        &self,
        ride_id: Uuid,
        rider_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>> {
        self.ride_update(
            &format!(
                r#"
                UPDATE rides
                SET status = 'cancelled',
                    cancelled_at = GREATEST($3, requested_at, accepted_at, started_at),
                    updated_at = GREATEST($3, requested_at, accepted_at, started_at)
                WHERE id = $1
                  AND rider_id = $2
                  AND status IN {ACTIVE_STATUSES}
                RETURNING *
                "#
            ),
            ride_id,
            rider_id,
            now,
        )
        .await
    }

    async fn expire_ride(&self, ride_id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Ride>> {
        sqlx::query_as::<_, RideRow>(
            r#"
            UPDATE rides
            SET status = 'cancelled',
                cancelled_at = GREATEST($2, requested_at),
                updated_at = GREATEST($2, requested_at)
            WHERE id = $1
              AND status = 'requested'
            RETURNING *
            "#,
        )
        .bind(ride_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(Ride::try_from)
        .transpose()
    }

    async fn rate_ride(
        &self,
        ride_id: Uuid,
        rider_id: Uuid,
        rating: u8,
        feedback: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Ride>> {
        sqlx::query_as::<_, RideRow>(
            r#"
            UPDATE rides
            SET rating = $3,
                feedback = $4,
                updated_at = GREATEST($5, updated_at)
            WHERE id = $1
              AND rider_id = $2
              AND status = 'completed'
              AND rating IS NULL
            RETURNING *
            "#,
        )
        .bind(ride_id)
        .bind(rider_id)
        .bind(i16::from(rating))
        .bind(feedback)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(Ride::try_from)
        .transpose()
    }

    async fn active_ride_for_rider(&self, rider_id: Uuid) -> StoreResult<Option<Ride>> {
        sqlx::query_as::<_, RideRow>(&format!(
            "SELECT * FROM rides WHERE rider_id = $1 AND status IN {ACTIVE_STATUSES} LIMIT 1"
        ))
        .bind(rider_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Ride::try_from)
        .transpose()
    }

    async fn active_ride_for_driver(&self, driver_id: Uuid) -> StoreResult<Option<Ride>> {
        sqlx::query_as::<_, RideRow>(&format!(
            "SELECT * FROM rides WHERE driver_id = $1 AND status IN {ACTIVE_STATUSES} LIMIT 1"
        ))
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Ride::try_from)
        .transpose()
    }

    async fn requested_rides(&self, limit: usize) -> StoreResult<Vec<Ride>> {
        sqlx::query_as::<_, RideRow>(
            "SELECT * FROM rides WHERE status = 'requested' ORDER BY requested_at LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Ride::try_from)
        .collect()
    }

    async fn update_payment_status(
        &self,
        ride_id: Uuid,
        status: PaymentStatus,
        payment_id: Option<Uuid>,
    ) -> StoreResult<Ride> {
        sqlx::query_as::<_, RideRow>(
            r#"
            UPDATE rides
            SET payment_status = $2,
                payment_id = COALESCE($3, payment_id),
                updated_at = GREATEST(now(), updated_at)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(ride_id)
        .bind(status.as_str())
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("ride", ride_id))?
        .try_into()
    }

    async fn insert_payment(&self, payment: Payment) -> StoreResult<Payment> {
        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            INSERT INTO payments
                (id, ride_id, rider_id, amount, currency, gateway_order_id,
                 gateway_payment_id, gateway_signature, status, payment_method,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(payment.id)
        .bind(payment.ride_id)
        .bind(payment.rider_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(&payment.gateway_order_id)
        .bind(&payment.gateway_payment_id)
        .bind(&payment.gateway_signature)
        .bind(payment.status.as_str())
        .bind(payment.payment_method.as_str())
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Payment> {
        sqlx::query_as::<_, PaymentRow>("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("payment", id))?
            .try_into()
    }

    async fn payment_for_ride(&self, ride_id: Uuid) -> StoreResult<Option<Payment>> {
        sqlx::query_as::<_, PaymentRow>(
            "SELECT * FROM payments WHERE ride_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(ride_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Payment::try_from)
        .transpose()
    }

    async fn update_payment(&self, payment: Payment) -> StoreResult<Option<Payment>> {
        sqlx::query_as::<_, PaymentRow>(
            r#"
            UPDATE payments
            SET gateway_order_id = $2,
                gateway_payment_id = $3,
                gateway_signature = $4,
                status = $5,
                updated_at = $6
            WHERE id = $1
              AND status IN ('created', 'pending', 'authorized')
            RETURNING *
            "#,
        )
        .bind(payment.id)
        .bind(&payment.gateway_order_id)
        .bind(&payment.gateway_payment_id)
        .bind(&payment.gateway_signature)
        .bind(payment.status.as_str())
        .bind(payment.updated_at)
        .fetch_optional(&self.pool)
        .await?
        .map(Payment::try_from)
        .transpose()
    }
}
