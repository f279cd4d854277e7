use actix_web::{
    http::{header, StatusCode},
    HttpResponse, ResponseError,
};
use log::error;
use serde_json::json;
use thiserror::Error;

/// 对外返回的错误；`Internal` 的细节只写入日志
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid email or password")]
    Authentication,

    #[error("Unauthorized")]
    Unauthenticated,

    #[error("Forbidden")]
    Forbidden,

    #[error("Too many login attempts. Please try again later.")]
    RateLimited { retry_after: u64 },

    #[error("Internal server error")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Authentication | ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        match self {
            ApiError::RateLimited { retry_after } => builder
                .insert_header((header::RETRY_AFTER, retry_after.to_string()))
                .json(json!({
                    "error": self.to_string(),
                    "retryAfter": retry_after,
                })),
            ApiError::Internal(detail) => {
                error!("内部错误: {}", detail);
                builder.json(json!({ "error": self.to_string() }))
            }
            _ => builder.json(json!({ "error": self.to_string() })),
        }
    }
}
