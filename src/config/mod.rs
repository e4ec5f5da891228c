//! Configuration module for the gateway service
//!
//! This module handles loading and parsing configuration from TOML files.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Outbound request timeout in seconds (token issuer and backends)
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
        }
    }
}

/// Token issuer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenIssuerConfig {
    /// Base address of the token-issuing service
    pub base_address: String,
    /// Whether to reuse tokens until their advertised expiry
    #[serde(default)]
    pub cache_enabled: bool,
}

/// Target of the `Anonymous/Authenticate` alias route.
///
/// The caller-supplied path is never forwarded for anonymous requests; the
/// gateway always forwards to this fixed application and resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymousConfig {
    /// Application name of the authentication backend
    #[serde(default = "default_anonymous_application")]
    pub application: String,
    /// Login resource on the authentication backend
    #[serde(default = "default_login_route")]
    pub login_route: String,
}

fn default_anonymous_application() -> String {
    "auth".to_string()
}

fn default_login_route() -> String {
    "api/Users/authenticate".to_string()
}

impl Default for AnonymousConfig {
    fn default() -> Self {
        Self {
            application: default_anonymous_application(),
            login_route: default_login_route(),
        }
    }
}

/// Allow-list configuration for secure routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowListConfig {
    /// Permitted resource-path patterns (anchored regular expressions,
    /// matched against the lower-cased resource path)
    #[serde(default = "default_allow_patterns")]
    pub patterns: Vec<String>,
}

fn default_allow_patterns() -> Vec<String> {
    [
        r"^users/\d+$",
        r"^users/create$",
        r"^api/passwords/users/otp$",
        r"^api/passwords/user/\+\d{1,15}/otp/\d{4}/verify$",
        r"^api/passwords/changepassword$",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for AllowListConfig {
    fn default() -> Self {
        Self {
            patterns: default_allow_patterns(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is exposed. Off by default so that every
    /// path outside the recognized route shapes is rejected with 403.
    #[serde(default)]
    pub enabled: bool,
    /// Path to expose metrics
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_metrics_path(),
        }
    }
}

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Pre-shared API key forwarded to the token issuer and backends
    pub api_key: String,
    /// This gateway's identity, announced to the token issuer
    pub router_name: String,
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Token issuer configuration
    pub token_issuer: TokenIssuerConfig,
    /// Backend base addresses keyed by application name
    #[serde(default)]
    pub backends: HashMap<String, String>,
    /// Anonymous authenticate alias target
    #[serde(default)]
    pub anonymous: AnonymousConfig,
    /// Allow-list patterns for secure routes
    #[serde(default)]
    pub allow_list: AllowListConfig,
    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load configuration from a TOML string
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.is_empty() {
            anyhow::bail!("api_key is not configured");
        }
        if self.router_name.is_empty() {
            anyhow::bail!("router_name is not configured");
        }
        if self.token_issuer.base_address.is_empty() {
            anyhow::bail!("token_issuer.base_address is not configured");
        }
        for (app, base) in &self.backends {
            if base.is_empty() {
                anyhow::bail!("backend '{}' has an empty base address", app);
            }
        }
        if self.anonymous.application.is_empty() {
            anyhow::bail!("anonymous.application is not configured");
        }
        for pattern in &self.allow_list.patterns {
            if let Err(e) = Regex::new(pattern) {
                anyhow::bail!("invalid allow-list pattern '{}': {}", pattern, e);
            }
        }
        Ok(())
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Outbound request timeout
    pub fn outbound_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout)
    }
}
