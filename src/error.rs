use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Failures of the prediction pipeline. Each variant maps to exactly one HTTP status class.
#[derive(Debug, Error)]
pub enum PredictionError {
    /// A request field is present but cannot be coerced to the expected type
    #[error("Invalid value for field '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// The backing model failed to load at startup
    #[error("{model} model is unavailable")]
    ModelUnavailable { model: &'static str, reason: String },

    #[error("Model inference failed: {0}")]
    ModelInference(String),

    #[error("Unable to decode image: {0}")]
    Decode(String),

    #[error("{0}")]
    MissingInput(String),

    /// The body is not the JSON object or multipart form the endpoint expects
    #[error("{0}")]
    MalformedRequest(String),
}

impl PredictionError {
    pub(crate) fn validation(field: &str, reason: impl Into<String>) -> Self {
        PredictionError::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn inference(err: impl std::fmt::Display) -> Self {
        PredictionError::ModelInference(err.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PredictionError::Validation { .. }
            | PredictionError::Decode(_)
            | PredictionError::MissingInput(_)
            | PredictionError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            PredictionError::ModelUnavailable { .. } | PredictionError::ModelInference(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn to_http_response(&self) -> HttpErrorResponse {
        match self {
            PredictionError::ModelUnavailable { reason, .. } => HttpErrorResponse {
                error: self.to_string(),
                detail: Some(reason.clone()),
            },
            PredictionError::ModelInference(message) => HttpErrorResponse {
                error: "Server error during prediction".to_string(),
                detail: Some(message.clone()),
            },
            _ => HttpErrorResponse::from(self.to_string()),
        }
    }
}

// Adapted from https://github.com/tokio-rs/axum/blob/main/examples/anyhow-error-response/src/main.rs
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: HttpErrorResponse,
}

#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    pub(crate) error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) detail: Option<String>,
}

impl From<String> for HttpErrorResponse {
    fn from(message: String) -> Self {
        HttpErrorResponse {
            error: message,
            detail: None,
        }
    }
}

impl From<&str> for HttpErrorResponse {
    fn from(message: &str) -> Self {
        HttpErrorResponse::from(message.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut res = Json(self.message).into_response();
        *res.status_mut() = self.status;
        res
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let err = err.into();
        match err.downcast_ref::<PredictionError>() {
            Some(prediction_err) => ApiError {
                status: prediction_err.status(),
                message: prediction_err.to_http_response(),
            },
            None => ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: HttpErrorResponse {
                    error: "Internal server error".to_string(),
                    detail: Some(err.to_string()),
                },
            },
        }
    }
}

pub type ApiResult<T, E = ApiError> = Result<T, E>;

#[macro_export]
macro_rules! bail_api {
    ($status_code:expr, $error_message:expr) => {
        return Err($crate::error::ApiError {
            status: $status_code,
            message: $crate::error::HttpErrorResponse::from($error_message),
        })
    };
    ($status:expr, $fmt:expr $(, $arg:expr)*) => {
        return Err($crate::error::ApiError {
            status: $status,
            message: $crate::error::HttpErrorResponse::from(format!($fmt $(, $arg)*)),
        })
    };
}
