//! Coded JSON error responses for public callers.
//!
//! Body shape is `{"code": <int>, "msg": <string>}`; the HTTP status and the
//! code are chosen per error kind (5xxx internal, 4xxx client).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub msg: String,
}

/// Errors surfaced directly to public callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    /// No gateway link, tunnel send failure, or abandoned reply slot.
    Internal,
    /// Missing `bridging-base-url` or an unreadable request.
    BadRequest,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            ApiError::Internal => 5000,
            ApiError::BadRequest => 4000,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            msg: String::new(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_body_shape() {
        let body = ErrorBody {
            code: ApiError::Internal.code(),
            msg: String::new(),
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"code":5000,"msg":""}"#
        );
        assert_eq!(ApiError::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn bad_request_maps_to_400() {
        assert_eq!(ApiError::BadRequest.code(), 4000);
        assert_eq!(ApiError::BadRequest.status(), StatusCode::BAD_REQUEST);
    }
}
