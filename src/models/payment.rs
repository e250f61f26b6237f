use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::ride::PaymentMethod;
use crate::models::text_enum;

pub const DEFAULT_CURRENCY: &str = "INR";

text_enum! {
    pub enum PaymentState {
        Created => "created",
        Pending => "pending",
        Authorized => "authorized",
        Captured => "captured",
        Failed => "failed",
        Refunded => "refunded",
    }
}

impl PaymentState {
    /// Still waiting on the rider or the gateway.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Created | Self::Pending | Self::Authorized)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub rider_id: Uuid,
    pub amount: f64,
    pub currency: String,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    #[serde(skip_serializing)]
    pub gateway_signature: Option<String>,
    pub status: PaymentState,
    pub payment_method: PaymentMethod,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePaymentOrderRequest {
    pub ride_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentOrder {
    pub payment_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_key_id: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyPaymentRequest {
    pub payment_id: Uuid,
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CashPaymentRequest {
    pub payment_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpiPaymentRequest {
    pub payment_id: Uuid,
    pub upi_id: String,
}

impl UpiPaymentRequest {
    /// Accepts virtual payment addresses of the form `handle@provider`.
    pub fn validate(&self) -> Result<(), AppError> {
        let upi_id = self.upi_id.trim();
        let well_formed = upi_id.len() <= 100
            && upi_id
                .split_once('@')
                .is_some_and(|(handle, provider)| {
                    handle.len() >= 2
                        && !provider.is_empty()
                        && !provider.contains('@')
                        && !upi_id.contains(char::is_whitespace)
                });
        if !well_formed {
            return Err(AppError::BadRequest("upi_id must look like name@bank".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upi(upi_id: &str) -> UpiPaymentRequest {
        UpiPaymentRequest {
            payment_id: Uuid::new_v4(),
            upi_id: upi_id.to_string(),
        }
    }

    #[test]
    fn upi_ids_need_a_handle_and_a_provider() {
        assert!(upi("asha.rao@okbank").validate().is_ok());
        assert!(upi("asharao").validate().is_err());
        assert!(upi("a@bank").validate().is_err());
        assert!(upi("asha@").validate().is_err());
        assert!(upi("asha rao@bank").validate().is_err());
        assert!(upi("asha@ok@bank").validate().is_err());
    }

    #[test]
    fn only_unfinished_payments_are_open() {
        assert!(PaymentState::Created.is_open());
        assert!(PaymentState::Pending.is_open());
        assert!(!PaymentState::Captured.is_open());
        assert!(!PaymentState::Failed.is_open());
    }
}
