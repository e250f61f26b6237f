use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a caller. Internal detail never leaves the process.
    pub fn public_message(&self) -> String {
        match self {
            AppError::BadRequest(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg) => msg.clone(),
            AppError::Unauthorized => "unauthorized".to_string(),
            AppError::Internal(_) => "an internal error occurred".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(detail) = &self {
            tracing::error!(error = %detail, "internal server error");
        }

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        }));

        (self.status(), body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => {
                AppError::NotFound(format!("{entity} not found: {id}"))
            }
            StoreError::Conflict(msg) => AppError::Conflict(msg),
            StoreError::Constraint { message, .. } => AppError::BadRequest(message),
            StoreError::Database(msg) => AppError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConstraintKind;

    #[test]
    fn internal_detail_is_not_public() {
        let err = AppError::Internal("relation \"rides\" does not exist".to_string());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "an internal error occurred");
    }

    #[test]
    fn store_errors_map_onto_taxonomy() {
        let not_found: AppError = StoreError::NotFound {
            entity: "ride",
            id: "42".to_string(),
        }
        .into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let conflict: AppError = StoreError::Conflict("taken".to_string()).into();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let constraint: AppError = StoreError::Constraint {
            kind: ConstraintKind::NotNull,
            message: "The Pickup Address is required".to_string(),
        }
        .into();
        assert_eq!(constraint.status(), StatusCode::BAD_REQUEST);
        assert_eq!(constraint.public_message(), "The Pickup Address is required");

        let db: AppError = StoreError::Database("connection reset".to_string()).into();
        assert_eq!(db.code(), "internal_error");
    }
}
