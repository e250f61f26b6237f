#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use ride_dispatch::api::rest::router;
use ride_dispatch::auth::issue_token;
use ride_dispatch::config::Config;
use ride_dispatch::models::user::Role;
use ride_dispatch::state::AppState;
use ride_dispatch::store::MemoryStore;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

#[derive(Clone)]
pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
}

#[derive(Clone)]
pub struct Caller {
    pub id: Uuid,
    pub token: String,
}

pub fn setup() -> TestApp {
    setup_with(Config::default())
}

pub fn setup_with(config: Config) -> TestApp {
    let (state, hub) = AppState::new(config, Arc::new(MemoryStore::new()));
    tokio::spawn(hub.run());
    let state = Arc::new(state);
    TestApp {
        router: router(state.clone()),
        state,
    }
}

impl TestApp {
    pub fn caller(&self, role: Role) -> Caller {
        let id = Uuid::new_v4();
        let token = issue_token(
            &self.state.config.jwt_secret,
            id,
            role,
            chrono::Duration::hours(1),
        )
        .unwrap();
        Caller { id, token }
    }

    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        caller: Option<&Caller>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(caller) = caller {
            request = request.header("authorization", format!("Bearer {}", caller.token));
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    pub async fn rider(&self) -> Caller {
        let rider = self.caller(Role::Rider);
        let (status, _) = self
            .send(
                "PUT",
                "/users/me",
                Some(&rider),
                Some(json!({"name": "Asha Rao", "phone": "+919800000001"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        rider
    }

    /// A driver with a name, a profile and a live position next to the
    /// standard pickup point.
    pub async fn driver(&self) -> Caller {
        let driver = self.caller(Role::Driver);
        let (status, _) = self
            .send(
                "PUT",
                "/users/me",
                Some(&driver),
                Some(json!({"name": "Ravi Kumar", "phone": "+919800000002"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = self
            .send(
                "POST",
                "/drivers/profile",
                Some(&driver),
                Some(json!({
                    "vehicle_type": "auto",
                    "vehicle_number": "ka01ab1234",
                    "capacity": 3
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = self
            .send(
                "POST",
                "/drivers/location",
                Some(&driver),
                Some(json!({"location": {"latitude": 12.9720, "longitude": 77.5950}})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        driver
    }

    pub async fn request_ride(&self, rider: &Caller) -> Value {
        let (status, body) = self
            .send("POST", "/rides", Some(rider), Some(ride_request()))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body
    }

    /// Pushes the ride through accept and start, returning its id.
    pub async fn ride_in_progress(&self, rider: &Caller, driver: &Caller) -> String {
        let ride = self.request_ride(rider).await;
        let id = ride["id"].as_str().unwrap().to_string();

        let (status, _) = self
            .send("POST", &format!("/rides/{id}/accept"), Some(driver), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let otp = self.rider_otp(rider).await;
        let (status, _) = self
            .send(
                "POST",
                &format!("/rides/{id}/start"),
                Some(driver),
                Some(json!({"otp": otp})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        id
    }

    pub async fn rider_otp(&self, rider: &Caller) -> String {
        let (status, active) = self.send("GET", "/rides/active", Some(rider), None).await;
        assert_eq!(status, StatusCode::OK);
        active["otp"].as_str().unwrap().to_string()
    }

    /// Registers a fake connection for `user_id` with the realtime hub.
    pub async fn listen(&self, user_id: Uuid) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);
        self.state
            .hub
            .register(self.state.hub.next_connection_id(), user_id, tx)
            .await
            .unwrap();
        rx
    }
}

pub async fn next_event(rx: &mut mpsc::Receiver<String>) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within timeout")
        .expect("channel closed");
    serde_json::from_str(&text).unwrap()
}

/// MG Road Metro to Koramangala.
pub fn ride_request() -> Value {
    json!({
        "pickup_location": {"latitude": 12.9716, "longitude": 77.5946},
        "pickup_address": "MG Road Metro Station",
        "dropoff_location": {"latitude": 12.9352, "longitude": 77.6245},
        "dropoff_address": "Koramangala 5th Block",
        "vehicle_type": "auto",
        "payment_method": "cash"
    })
}
