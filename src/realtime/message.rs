//! Wire format of the realtime channel: `{type, payload, target?}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::location::LocationUpdate;
use crate::models::ride::RideView;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct RideRef {
    ride_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct StartPayload {
    ride_id: Uuid,
    otp: String,
}

/// A command sent by a connected client, decoded once at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    AcceptRide { ride_id: Uuid },
    StartRide { ride_id: Uuid, otp: String },
    CompleteRide { ride_id: Uuid },
    CancelRide { ride_id: Uuid },
    DriverLocationUpdate(LocationUpdate),
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {reason}")]
    Payload { kind: String, reason: String },
}

impl DecodeError {
    /// The `type` the client sent, when it got that far.
    pub fn request_type(&self) -> Option<&str> {
        match self {
            DecodeError::Malformed(_) => None,
            DecodeError::UnknownType(kind) | DecodeError::Payload { kind, .. } => {
                Some(kind.as_str())
            }
        }
    }
}

impl ClientCommand {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|err| DecodeError::Malformed(err.to_string()))?;
        let kind = envelope.kind.as_str();

        let command = match kind {
            "accept_ride" => {
                let RideRef { ride_id } = payload(kind, envelope.payload)?;
                ClientCommand::AcceptRide { ride_id }
            }
            "start_ride" => {
                let StartPayload { ride_id, otp } = payload(kind, envelope.payload)?;
                ClientCommand::StartRide { ride_id, otp }
            }
            "complete_ride" => {
                let RideRef { ride_id } = payload(kind, envelope.payload)?;
                ClientCommand::CompleteRide { ride_id }
            }
            "cancel_ride" => {
                let RideRef { ride_id } = payload(kind, envelope.payload)?;
                ClientCommand::CancelRide { ride_id }
            }
            "driver_location_update" => {
                ClientCommand::DriverLocationUpdate(payload(kind, envelope.payload)?)
            }
            other => return Err(DecodeError::UnknownType(other.to_string())),
        };
        Ok(command)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientCommand::AcceptRide { .. } => "accept_ride",
            ClientCommand::StartRide { .. } => "start_ride",
            ClientCommand::CompleteRide { .. } => "complete_ride",
            ClientCommand::CancelRide { .. } => "cancel_ride",
            ClientCommand::DriverLocationUpdate(_) => "driver_location_update",
        }
    }
}

fn payload<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|err| DecodeError::Payload {
        kind: kind.to_string(),
        reason: err.to_string(),
    })
}

/// Events pushed to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    NewRideRequest(RideView),
    RideAccepted(RideView),
    RideStarted(RideView),
    RideCompleted(RideView),
    RideCancelled(RideView),
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_type: Option<String>,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::NewRideRequest(_) => "new_ride_request",
            ServerEvent::RideAccepted(_) => "ride_accepted",
            ServerEvent::RideStarted(_) => "ride_started",
            ServerEvent::RideCompleted(_) => "ride_completed",
            ServerEvent::RideCancelled(_) => "ride_cancelled",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::location::GeoPoint;

    #[test]
    fn decodes_each_inbound_type() {
        let ride_id = Uuid::new_v4();
        for (kind, expected) in [
            ("accept_ride", ClientCommand::AcceptRide { ride_id }),
            ("complete_ride", ClientCommand::CompleteRide { ride_id }),
            ("cancel_ride", ClientCommand::CancelRide { ride_id }),
        ] {
            let text = json!({"type": kind, "payload": {"ride_id": ride_id}}).to_string();
            assert_eq!(ClientCommand::decode(&text), Ok(expected));
        }

        let text = json!({
            "type": "start_ride",
            "payload": {"ride_id": ride_id, "otp": "4821"},
            "target": "ignored"
        })
        .to_string();
        assert_eq!(
            ClientCommand::decode(&text),
            Ok(ClientCommand::StartRide {
                ride_id,
                otp: "4821".to_string()
            })
        );
    }

    #[test]
    fn location_payload_ignores_claimed_driver_id() {
        let text = json!({
            "type": "driver_location_update",
            "payload": {
                "driver_id": Uuid::new_v4(),
                "location": {"latitude": 12.97, "longitude": 77.59},
                "heading": 90.0
            }
        })
        .to_string();

        let Ok(ClientCommand::DriverLocationUpdate(update)) = ClientCommand::decode(&text) else {
            panic!("expected a location update");
        };
        assert_eq!(update.location, GeoPoint::new(12.97, 77.59));
        assert_eq!(update.heading, Some(90.0));
    }

    #[test]
    fn start_without_otp_is_a_payload_error() {
        let text = json!({"type": "start_ride", "payload": {"ride_id": Uuid::new_v4()}}).to_string();
        let err = ClientCommand::decode(&text).unwrap_err();
        assert_eq!(err.request_type(), Some("start_ride"));
        assert!(matches!(err, DecodeError::Payload { .. }));
    }

    #[test]
    fn unknown_and_malformed_messages_are_rejected() {
        let unknown = ClientCommand::decode(r#"{"type":"teleport","payload":{}}"#).unwrap_err();
        assert_eq!(unknown, DecodeError::UnknownType("teleport".to_string()));

        let malformed = ClientCommand::decode("not json").unwrap_err();
        assert_eq!(malformed.request_type(), None);
    }

    #[test]
    fn error_event_uses_type_and_payload_keys() {
        let event = ServerEvent::Error {
            message: "ride is no longer available".to_string(),
            request_type: Some("accept_ride".to_string()),
        };
        let value: Value = serde_json::from_str(&event.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "error",
                "payload": {
                    "message": "ride is no longer available",
                    "request_type": "accept_ride"
                }
            })
        );
    }
}
