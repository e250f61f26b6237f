use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::text_enum;

text_enum! {
    pub enum Role {
        Rider => "rider",
        Driver => "driver",
        Admin => "admin",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertUserRequest {
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl UpsertUserRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        let len = self.name.trim().chars().count();
        if !(2..=100).contains(&len) {
            return Err(AppError::BadRequest(
                "name must be between 2 and 100 characters".to_string(),
            ));
        }
        if let Some(phone) = &self.phone {
            let digits = phone.strip_prefix('+').unwrap_or(phone);
            if digits.is_empty()
                || digits.len() > 15
                || !digits.chars().all(|c| c.is_ascii_digit())
            {
                return Err(AppError::BadRequest(
                    "phone must be in E.164 format".to_string(),
                ));
            }
        }
        Ok(())
    }
}
