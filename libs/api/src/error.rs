use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// The error envelope every non-2xx response uses (spec §4.8): `{code,
/// message, request_id, details?}`.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>, request_id: &str) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: request_id.to_string(),
            details: None,
            status,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(resource: &str, request_id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", format!("{resource} not found"), request_id)
    }

    pub fn forbidden(action: &str, request_id: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", format!("missing permission: {action}"), request_id)
    }

    pub fn bad_request(message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message, request_id)
    }

    pub fn internal(message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message, request_id)
    }

    pub fn from_db_error(e: &guildnet_db::Error, request_id: &str) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "db_error", e.to_string(), request_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}
