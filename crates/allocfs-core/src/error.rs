//! Coded errors: failures that carry an HTTP-style status across a boundary.
//!
//! Anything that has to surface through the HTTP layer (a validation failure,
//! a transport fault, an error reported by a streaming handler) is converted
//! into a [`CodedError`] at the point it is first observed and is never
//! wrapped again.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::http::types::ErrorResponse;

/// A value that knows which HTTP status it should be rendered as.
pub trait HttpCoded: std::error::Error {
    /// The numeric status code.
    fn code(&self) -> u16;
}

/// An error carrying a numeric status code and a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CodedError {
    code: u16,
    message: String,
}

impl CodedError {
    /// Create a coded error.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Build a coded error from a wire-level code of arbitrary width.
    ///
    /// Codes that cannot be a status are reported as 500.
    pub fn from_wire(code: i64, message: impl Into<String>) -> Self {
        let code = u16::try_from(code).unwrap_or(500);
        Self::new(code, message)
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The HTTP status for this error; codes outside the valid range map to 500.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl HttpCoded for CodedError {
    fn code(&self) -> u16 {
        self.code
    }
}

impl IntoResponse for CodedError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}
