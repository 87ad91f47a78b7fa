use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use tracing::error;

use crate::broker::BrokerError;
use crate::protocols::openai::ErrorResponse;

/// Error returned by HTTP handlers, rendered in the OpenAI error shape
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    /// Well-formed JSON that fails field validation
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),

    #[error("Broker unavailable: {0}")]
    Broker(#[from] BrokerError),
}

impl ApiError {
    fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) | ApiError::Validation(_) | ApiError::PayloadTooLarge(_) => {
                "invalid_request_error"
            }
            ApiError::NotFound(_) => "not_found_error",
            ApiError::Timeout(_) => "timeout_error",
            ApiError::Internal(_) | ApiError::Broker(_) => "server_error",
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("{}", self);
        }
        HttpResponse::build(status).json(ErrorResponse::new(
            self.to_string(),
            self.error_type(),
            Some(status.as_u16().to_string()),
        ))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
