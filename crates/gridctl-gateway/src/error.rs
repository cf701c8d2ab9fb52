use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gridctl::error::{ErrorBody, GatewayError};

/// Wraps `GatewayError` so handlers can `?`-propagate it straight out of an
/// axum handler; status and body come from the error kinds in spec.md §7.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorBody = (&self.0).into();
        (status, Json(body)).into_response()
    }
}
