//! Error taxonomy and the uniform JSON error envelope
//!
//! Every rejection or fault the gateway produces maps to exactly one terminal
//! HTTP response carrying an `ErrorEnvelope` body. The numeric error codes
//! follow the catalog of the wider platform this gateway fronts.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fallback body used if the envelope itself cannot be serialized, so the
/// caller always receives well-formed JSON.
const GENERIC_ERROR_BODY: &str = r#"{"errorCode":1000,"message":"An unexpected error has occurred.","details":"Failed to serialize error response."}"#;

/// Gateway failure taxonomy
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request path is empty or malformed
    #[error("the request path is empty or malformed")]
    InvalidPath,

    /// The path fails classification or the allow-list check
    #[error("the requested URL is not supported by this gateway")]
    RouteNotSupported,

    /// The token issuer returned an empty or missing token value
    #[error("the token issuer returned an empty token")]
    TokenMalformed,

    /// The token issuer answered with a non-success status
    #[error("the token issuer returned status {status}")]
    UpstreamTokenFailure { status: u16 },

    /// No backend base address is configured for the requested application
    #[error("no base address is configured for application '{0}'")]
    MissingConfigData(String),

    /// The backend produced no response (transport failure or timeout)
    #[error("the backend did not respond: {0}")]
    UpstreamDispatchFailure(String),

    /// An upstream payload could not be parsed or rebuilt
    #[error("failed to process request or response data: {0}")]
    DataProcessing(String),

    /// The account behind the request is not verified
    #[error("the account is unverified")]
    AccountUnverified,

    /// Catch-all internal error
    #[error("{0}")]
    Generic(String),
}

impl GatewayError {
    /// Numeric error code for the envelope
    pub fn error_code(&self) -> u32 {
        match self {
            GatewayError::Generic(_) => 1000,
            GatewayError::DataProcessing(_) => 1004,
            GatewayError::InvalidPath => 1005,
            GatewayError::TokenMalformed => 1009,
            GatewayError::AccountUnverified => 1010,
            GatewayError::MissingConfigData(_) => 1011,
            GatewayError::RouteNotSupported => 1012,
            GatewayError::UpstreamDispatchFailure(_) => 1013,
            GatewayError::UpstreamTokenFailure { .. } => 1014,
        }
    }

    /// Fixed catalog message for the envelope
    pub fn message(&self) -> &'static str {
        match self {
            GatewayError::Generic(_) => "An unexpected error has occurred.",
            GatewayError::DataProcessing(_) => "An error occurred while processing data.",
            GatewayError::InvalidPath => "The input provided is invalid.",
            GatewayError::TokenMalformed => {
                "The token is malformed or invalid. Please check the token format."
            }
            GatewayError::AccountUnverified => {
                "Your account is currently unverified. Please verify your account to proceed."
            }
            GatewayError::MissingConfigData(_) => {
                "The config entry is missing from the application config."
            }
            GatewayError::RouteNotSupported => "The requested URL is not supported.",
            GatewayError::UpstreamDispatchFailure(_) => "Failed to reach the backend service.",
            GatewayError::UpstreamTokenFailure { .. } => "Failed to retrieve a service token.",
        }
    }

    /// HTTP status the failure surfaces as
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidPath => StatusCode::BAD_REQUEST,
            GatewayError::RouteNotSupported => StatusCode::FORBIDDEN,
            GatewayError::TokenMalformed => StatusCode::UNAUTHORIZED,
            // An auth-flavored refusal from the issuer surfaces as 401, any
            // other issuer failure is an internal error.
            GatewayError::UpstreamTokenFailure { status } => match status {
                401 | 403 => StatusCode::UNAUTHORIZED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            GatewayError::AccountUnverified => StatusCode::BAD_REQUEST,
            GatewayError::MissingConfigData(_)
            | GatewayError::UpstreamDispatchFailure(_)
            | GatewayError::DataProcessing(_)
            | GatewayError::Generic(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Build the uniform envelope body
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error_code: self.error_code(),
            message: self.message().to_string(),
            details: self.to_string(),
        }
    }
}

/// The only response body shape used for any failure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error_code: u32,
    pub message: String,
    pub details: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::to_string(&self.envelope())
            .unwrap_or_else(|_| GENERIC_ERROR_BODY.to_string());
        (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}
