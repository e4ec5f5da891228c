//! Bridge Gateway - an authenticating reverse-proxy gateway
//!
//! This service sits in front of a set of backend services and provides:
//! - Path classification and a route allow-list for secure routes
//! - Service-to-service bearer token acquisition and injection
//! - Request rebuilding (JSON, multipart, url-encoded bodies) and forwarding
//! - Correlation id propagation end-to-end
//! - A uniform JSON error envelope for every rejection or fault

pub mod allow_list;
pub mod config;
pub mod correlation;
pub mod error;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod token;

pub use config::GatewayConfig;
pub use error::GatewayError;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
