//! Maps control-plane errors onto HTTP responses: JSON is reserved for success bodies, errors are
//! returned as plain text with the status code `Error::http_status` assigns.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use vps_common::Error;

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.0.to_string()).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
