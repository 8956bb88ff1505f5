use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub detail: Option<String>,
}

/// Query-surface error kinds. Internal errors surface their message as
/// detail; stack traces never leave the process.
#[derive(Debug)]
pub enum ApiError {
    InvalidArgument(String),
    Internal(String),
}

impl ApiError {
    pub fn internal(e: impl std::fmt::Display) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::InvalidArgument(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse { error: "invalid_argument".to_owned(), detail: Some(msg) },
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse { error: "internal".to_owned(), detail: Some(msg) },
            ),
        };

        (status, Json(body)).into_response()
    }
}
