//! Maps internal failures onto HTTP status codes without leaking internals
//! (§7 propagation policy: the API never forwards a stack trace).

use crate::error::BalancerError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub struct ApiError(StatusCode, String);

impl From<BalancerError> for ApiError {
    fn from(err: BalancerError) -> Self {
        let status = match &err {
            BalancerError::HypervisorUnavailable(_) => StatusCode::BAD_GATEWAY,
            BalancerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            BalancerError::Infeasible { .. } => StatusCode::CONFLICT,
            BalancerError::DispatchRejected { .. } => StatusCode::CONFLICT,
            BalancerError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            BalancerError::ApiUnauthorized => StatusCode::UNAUTHORIZED,
            BalancerError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        Self(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "status": "error", "message": self.1 }))).into_response()
    }
}
