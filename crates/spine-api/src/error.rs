// Error envelope shared by every endpoint

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use spine_core::SpineError;

/// Uniform error body: `{code, message, details?}`
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Wrapper mapping core errors onto HTTP statuses
pub struct ApiError(pub SpineError);

impl From<SpineError> for ApiError {
    fn from(err: SpineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.code() {
            "PIPELINE_NOT_FOUND" | "NOT_FOUND" => StatusCode::NOT_FOUND,
            "INVALID_PARAMS" | "VALIDATION" | "PARSE" | "CONFIG" => StatusCode::BAD_REQUEST,
            "DUPLICATE_LOGICAL_KEY" | "LOCK_CONTENDED" | "NOT_CANCELLABLE" => {
                StatusCode::CONFLICT
            }
            "AUTH" => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
