//! Correlation id propagation
//!
//! A correlation id accompanies a request across every hop: inbound caller,
//! token issuer, backend, and the outbound response. When the caller supplies
//! none, the gateway generates a fresh one.

use axum::http::{HeaderMap, HeaderName};
use uuid::Uuid;

/// Header used on every hop, inbound and outbound.
pub const CORRELATION_HEADER: HeaderName = HeaderName::from_static("correlation-id");

/// Take the caller's correlation id, or generate a new unique one.
pub fn correlation_id_from(headers: &HeaderMap) -> String {
    headers
        .get(&CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
