use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Status-code-relevant shape shared by the runtime and integration error
/// kinds, so one handler can map either to an HTTP response.
#[derive(Debug, Clone, Copy)]
enum Status {
    InvalidInput,
    NotFound,
    Timeout,
    Unavailable,
    SafetyRelevant,
    Fatal,
}

/// Wraps whichever core error reached the handler, carrying a stable code
/// and message straight through to the HTTP response.
pub struct ApiError {
    status: Status,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn runtime(err: abathur::runtime::RuntimeError) -> Self {
        let status = match err.kind() {
            abathur::runtime::ErrorKind::InvalidInput => Status::InvalidInput,
            abathur::runtime::ErrorKind::NotFound => Status::NotFound,
            abathur::runtime::ErrorKind::Timeout => Status::Timeout,
            abathur::runtime::ErrorKind::Unavailable | abathur::runtime::ErrorKind::Transient => {
                Status::Unavailable
            }
            abathur::runtime::ErrorKind::SafetyRelevant => Status::SafetyRelevant,
            abathur::runtime::ErrorKind::Fatal => Status::Fatal,
        };
        Self { status, code: err.code(), message: err.to_string() }
    }

    pub fn integration(err: abathur::integration::IntegrationError) -> Self {
        let status = match err.kind() {
            abathur::integration::ErrorKind::InvalidInput => Status::InvalidInput,
            abathur::integration::ErrorKind::NotFound => Status::NotFound,
            abathur::integration::ErrorKind::Timeout => Status::Timeout,
            abathur::integration::ErrorKind::Unavailable
            | abathur::integration::ErrorKind::Transient => Status::Unavailable,
            abathur::integration::ErrorKind::Fatal => Status::Fatal,
        };
        Self { status, code: err.code(), message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = match self.status {
            Status::InvalidInput => StatusCode::BAD_REQUEST,
            Status::NotFound => StatusCode::NOT_FOUND,
            Status::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Status::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Status::SafetyRelevant => StatusCode::FORBIDDEN,
            Status::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status_code, Json(json!({ "error": { "code": self.code, "message": self.message } }))).into_response()
    }
}
