use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use booking_core::Error as EngineError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ApiError::Validation(errors.to_string())
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        let error_message = self.to_string();

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": error_message,
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Engine(e) => match e {
                EngineError::SlotNotFound(_)
                | EngineError::BookingNotFound(_)
                | EngineError::PaymentNotFound(_)
                | EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                EngineError::SlotFull(_)
                | EngineError::SlotInactive(_)
                | EngineError::InvalidTransition { .. }
                | EngineError::ConflictingOutcome { .. }
                | EngineError::DuplicateTransaction(_)
                | EngineError::AlreadyPaid { .. } => StatusCode::CONFLICT,
                EngineError::AmountMismatch { .. } | EngineError::InvalidSchedule(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                EngineError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::Validation(_) => StatusCode::BAD_REQUEST,
                EngineError::Storage(_)
                | EngineError::Concurrency(_)
                | EngineError::Config(_)
                | EngineError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl ApiError {
    fn error_type(&self) -> &str {
        match self {
            ApiError::Engine(e) => e.kind(),
            ApiError::Validation(_) => "validation_error",
        }
    }
}
