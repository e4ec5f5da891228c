//! Token acquisition client
//!
//! This module calls the upstream token-issuing service and returns a
//! short-lived bearer token. The baseline behavior is one full round-trip per
//! inbound request; expiry-aware reuse is an explicit, toggleable policy
//! component ([`TokenCache`]).

use crate::config::GatewayConfig;
use crate::correlation::CORRELATION_HEADER;
use crate::error::GatewayError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Issuer endpoint, relative to the configured base address
const TOKEN_ENDPOINT: &str = "api/Application/get/token";

/// Pre-shared API key header, sent to the issuer and to backends
pub const API_KEY_HEADER: HeaderName = HeaderName::from_static("apikey");

/// Calling-application header, set once at construction
const APPLICATION_HEADER: HeaderName = HeaderName::from_static("application");

/// A service token as issued by the token service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceToken {
    pub token: String,
    #[serde(rename = "expiryInSeconds")]
    pub expiry_in_seconds: i64,
}

/// Request body sent to the issuer
#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    #[serde(rename = "ApplicationName")]
    application_name: &'a str,
}

/// Expiry-aware single-slot token cache.
///
/// Stores at most one token and serves it until its advertised expiry has
/// passed. Tokens without a positive expiry are never stored.
#[derive(Debug, Default)]
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

#[derive(Debug)]
struct CachedToken {
    token: ServiceToken,
    expires_at: Instant,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A still-valid cached token, if any
    pub fn get(&self) -> Option<ServiceToken> {
        let slot = self.slot.lock().ok()?;
        match slot.as_ref() {
            Some(cached) if Instant::now() < cached.expires_at => Some(cached.token.clone()),
            _ => None,
        }
    }

    /// Store a token until its advertised expiry
    pub fn store(&self, token: &ServiceToken) {
        if token.token.is_empty() || token.expiry_in_seconds <= 0 {
            return;
        }
        let expires_at = Instant::now() + Duration::from_secs(token.expiry_in_seconds as u64);
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(CachedToken {
                token: token.clone(),
                expires_at,
            });
        }
    }
}

/// Client for the upstream token issuer.
///
/// The `ApiKey` and `Application` headers are set once at construction; the
/// correlation id travels as a per-call header.
pub struct TokenProvider {
    client: reqwest::Client,
    token_url: String,
    router_name: String,
    cache: Option<TokenCache>,
}

impl TokenProvider {
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_str(&config.api_key)?);
        headers.insert(APPLICATION_HEADER, HeaderValue::from_str(&config.router_name)?);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.outbound_timeout())
            .build()?;

        let token_url = format!(
            "{}/{}",
            config.token_issuer.base_address.trim_end_matches('/'),
            TOKEN_ENDPOINT
        );

        Ok(Self {
            client,
            token_url,
            router_name: config.router_name.clone(),
            cache: config.token_issuer.cache_enabled.then(TokenCache::new),
        })
    }

    /// Fetch a token from the issuer, or serve a cached one when the cache
    /// policy is enabled and holds a still-valid token.
    pub async fn get_token(&self, correlation_id: &str) -> Result<ServiceToken, GatewayError> {
        if let Some(cache) = &self.cache {
            if let Some(token) = cache.get() {
                debug!("serving cached service token");
                return Ok(token);
            }
        }

        let mut request = self.client.post(&self.token_url).json(&TokenRequest {
            application_name: &self.router_name,
        });
        if !correlation_id.is_empty() {
            request = request.header(&CORRELATION_HEADER, correlation_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Generic(format!("token issuer unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::UpstreamTokenFailure {
                status: response.status().as_u16(),
            });
        }

        let token: ServiceToken = response
            .json()
            .await
            .map_err(|e| GatewayError::DataProcessing(format!("token response: {e}")))?;

        if let Some(cache) = &self.cache {
            cache.store(&token);
        }
        Ok(token)
    }
}
