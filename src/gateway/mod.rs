//! The request-routing and forwarding pipeline
//!
//! Every inbound request runs through the same sequence: path classification,
//! allow-list enforcement for secure routes, service token acquisition,
//! outbound request construction, dispatch, and response relay. Each
//! rejection or fault is terminal and produces exactly one response.

use crate::allow_list::AllowList;
use crate::config::{AnonymousConfig, GatewayConfig};
use crate::correlation::{correlation_id_from, CORRELATION_HEADER};
use crate::error::GatewayError;
use crate::health::HealthStatus;
use crate::metrics::GatewayMetrics;
use crate::token::{TokenProvider, API_KEY_HEADER};
use axum::body::{Body, Bytes};
use axum::extract::{FromRequest, Multipart, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::{Json, Router};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

/// Characters escaped within a single path segment
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'%')
    .add(b'/')
    .add(b'\\');

/// Characters escaped within a query value or form field
const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'&')
    .add(b'=')
    .add(b'%')
    .add(b'+');

/// What the inbound path resolves to.
///
/// Classification is case-insensitive on the route shape; the original
/// casing of `app` and `resource` is preserved for forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteClassification {
    /// The gateway's own health route, answered without any upstream call
    Health,
    /// The fixed-alias login route of the authentication backend
    AnonymousAuthenticate,
    /// A `Secure/{app}/{resource}` route subject to the allow-list
    Secure { app: String, resource: String },
    /// A path outside every recognized route shape
    Forbidden,
    /// An empty or malformed path
    Invalid,
}

impl RouteClassification {
    /// Fixed-cardinality label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            RouteClassification::Health => "health",
            RouteClassification::AnonymousAuthenticate => "anonymous",
            RouteClassification::Secure { .. } => "secure",
            RouteClassification::Forbidden => "forbidden",
            RouteClassification::Invalid => "invalid",
        }
    }
}

/// Classify a raw request path
pub fn classify(path: &str) -> RouteClassification {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return RouteClassification::Invalid;
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower == "health" {
        return RouteClassification::Health;
    }
    if lower == "anonymous/authenticate" {
        return RouteClassification::AnonymousAuthenticate;
    }
    if lower.starts_with("secure/") {
        let rest = &trimmed["secure/".len()..];
        let (app, resource) = match rest.split_once('/') {
            Some((app, resource)) => (app, resource),
            None => (rest, ""),
        };
        if app.is_empty() {
            return RouteClassification::Forbidden;
        }
        return RouteClassification::Secure {
            app: app.to_string(),
            resource: resource.to_string(),
        };
    }

    RouteClassification::Forbidden
}

/// One part of a multipart form body
#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// The rebuilt request body, decided once from the inbound `Content-Type`.
///
/// A body-bearing method with any other content type forwards no body at all;
/// that mirrors the system this gateway replaces and is deliberate.
#[derive(Debug, Clone)]
pub enum BodyKind {
    Json(Bytes),
    Multipart(Vec<MultipartPart>),
    UrlEncoded(Vec<(String, String)>),
    Empty,
}

impl BodyKind {
    /// Methods the gateway forwards a body for
    fn method_carries_body(method: &Method) -> bool {
        matches!(
            *method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE | Method::HEAD
        )
    }

    /// Snapshot the inbound body according to its declared content type
    pub async fn extract(
        method: &Method,
        headers: &HeaderMap,
        body: Body,
    ) -> Result<BodyKind, GatewayError> {
        if !Self::method_carries_body(method) {
            return Ok(BodyKind::Empty);
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("application/json") {
            let bytes = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| GatewayError::DataProcessing(format!("request body: {e}")))?;
            return Ok(BodyKind::Json(bytes));
        }

        if content_type.starts_with("multipart/form-data") {
            // The multipart parser only needs the boundary from Content-Type,
            // so a minimal synthetic request is enough to drive it.
            let content_type_value = headers
                .get(header::CONTENT_TYPE)
                .cloned()
                .ok_or_else(|| GatewayError::DataProcessing("missing content type".into()))?;
            let synthetic = Request::builder()
                .method(Method::POST)
                .header(header::CONTENT_TYPE, content_type_value)
                .body(body)
                .map_err(|e| GatewayError::DataProcessing(format!("multipart body: {e}")))?;
            let mut multipart = Multipart::from_request(synthetic, &())
                .await
                .map_err(|e| GatewayError::DataProcessing(format!("multipart body: {e}")))?;

            let mut parts = Vec::new();
            while let Some(field) = multipart
                .next_field()
                .await
                .map_err(|e| GatewayError::DataProcessing(format!("multipart field: {e}")))?
            {
                let name = field.name().unwrap_or_default().to_string();
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::DataProcessing(format!("multipart field: {e}")))?;
                parts.push(MultipartPart {
                    name,
                    file_name,
                    content_type,
                    data,
                });
            }
            return Ok(BodyKind::Multipart(parts));
        }

        if content_type.starts_with("application/x-www-form-urlencoded") {
            let bytes = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| GatewayError::DataProcessing(format!("request body: {e}")))?;
            return Ok(BodyKind::UrlEncoded(parse_form(&bytes)));
        }

        Ok(BodyKind::Empty)
    }

    /// Re-encode the body for the outbound request, returning the content
    /// type to declare alongside the payload.
    pub fn encode(&self) -> (Option<HeaderValue>, Bytes) {
        match self {
            BodyKind::Json(bytes) => (
                Some(HeaderValue::from_static("application/json")),
                bytes.clone(),
            ),
            BodyKind::Multipart(parts) => {
                let boundary = multipart_boundary();
                let content_type = format!("multipart/form-data; boundary={boundary}");
                let body = encode_multipart(parts, &boundary);
                (
                    HeaderValue::from_str(&content_type).ok(),
                    Bytes::from(body),
                )
            }
            BodyKind::UrlEncoded(fields) => {
                let body = fields
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "{}={}",
                            utf8_percent_encode(k, QUERY_VALUE),
                            utf8_percent_encode(v, QUERY_VALUE)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("&");
                (
                    Some(HeaderValue::from_static(
                        "application/x-www-form-urlencoded",
                    )),
                    Bytes::from(body),
                )
            }
            BodyKind::Empty => (None, Bytes::new()),
        }
    }
}

/// Decode url-encoded form fields, preserving order and repeated keys
fn parse_form(bytes: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(bytes);
    text.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_form_component(key), decode_form_component(value))
        })
        .collect()
}

fn decode_form_component(s: &str) -> String {
    let spaced = s.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

fn multipart_boundary() -> String {
    let tail: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("bridge-{tail}")
}

/// Serialize parts under the given boundary, one part per uploaded file or
/// form field.
fn encode_multipart(parts: &[MultipartPart], boundary: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        out.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"", part.name).as_bytes(),
        );
        if let Some(file_name) = &part.file_name {
            out.extend_from_slice(format!("; filename=\"{file_name}\"").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        if let Some(content_type) = &part.content_type {
            out.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&part.data);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    out
}

/// Headers never copied from the inbound request: hop-by-hop headers, Host
/// (set from the target), and content headers (recomputed from the rebuilt
/// body).
fn is_managed_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-type"
            | "content-length"
    )
}

/// Extract host and optional port from a URL string
fn extract_host_from_url(url: &str) -> Option<String> {
    url.parse::<Uri>()
        .ok()?
        .authority()
        .map(|a| a.to_string())
}

/// Re-serialize a query string: key order and repeats preserved, every value
/// percent-encoded independently.
fn rebuild_query(query: Option<&str>) -> Option<String> {
    let query = query.filter(|q| !q.is_empty())?;
    let rebuilt = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => {
                let decoded = percent_decode_str(value).decode_utf8_lossy();
                format!("{}={}", key, utf8_percent_encode(&decoded, QUERY_VALUE))
            }
            None => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    Some(rebuilt)
}

/// Target URI: backend base address, segment-encoded resource path, and the
/// re-serialized query string.
fn build_target_uri(base: &str, resource: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let path = resource
        .split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/");
    match rebuild_query(query) {
        Some(q) => format!("{base}/{path}?{q}"),
        None => format!("{base}/{path}"),
    }
}

type ProxyClient = Client<HttpConnector, BoxBody<Bytes, hyper::Error>>;

/// The gateway service: shared, read-only state for the request pipeline
pub struct Gateway {
    client: ProxyClient,
    token_provider: TokenProvider,
    allow_list: AllowList,
    backends: HashMap<String, String>,
    api_key: HeaderValue,
    anonymous: AnonymousConfig,
    timeout: Duration,
    metrics: Arc<GatewayMetrics>,
}

impl Gateway {
    pub fn new(config: &GatewayConfig, metrics: Arc<GatewayMetrics>) -> anyhow::Result<Self> {
        let allow_list = AllowList::new(&config.allow_list.patterns)?;
        let token_provider = TokenProvider::new(config)?;
        let api_key = HeaderValue::from_str(&config.api_key)?;

        // Backend lookup is case-insensitive on the app name.
        let backends = config
            .backends
            .iter()
            .map(|(app, base)| (app.to_ascii_lowercase(), base.clone()))
            .collect();

        let client = Client::builder(TokioExecutor::new()).build_http();

        Ok(Self {
            client,
            token_provider,
            allow_list,
            backends,
            api_key,
            anonymous: config.anonymous.clone(),
            timeout: config.outbound_timeout(),
            metrics,
        })
    }

    /// Run one request through the pipeline and produce its single response
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let started = Instant::now();
        let method = req.method().clone();
        let correlation_id = correlation_id_from(req.headers());
        let classification = classify(req.uri().path());
        let label = classification.label();
        debug!(route = label, correlation_id = %correlation_id, "classified request");

        let result = match &classification {
            RouteClassification::Health => {
                Ok((StatusCode::OK, Json(HealthStatus::now())).into_response())
            }
            RouteClassification::Invalid => Err(GatewayError::InvalidPath),
            RouteClassification::Forbidden => Err(GatewayError::RouteNotSupported),
            RouteClassification::AnonymousAuthenticate => {
                let application = self.anonymous.application.clone();
                let login_route = self.anonymous.login_route.clone();
                self.forward(&application, &login_route, req, &correlation_id)
                    .await
            }
            RouteClassification::Secure { app, resource } => {
                if !self.allow_list.is_allowed(resource) {
                    Err(GatewayError::RouteNotSupported)
                } else {
                    self.forward(app, resource, req, &correlation_id).await
                }
            }
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "request failed");
                e.into_response()
            }
        };
        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            response.headers_mut().insert(&CORRELATION_HEADER, value);
        }

        self.metrics.record_request(
            method.as_str(),
            label,
            response.status().as_u16(),
            started.elapsed(),
        );
        response
    }

    /// Token acquisition, outbound construction, dispatch, and relay
    async fn forward(
        &self,
        app: &str,
        resource: &str,
        req: Request<Body>,
        correlation_id: &str,
    ) -> Result<Response<Body>, GatewayError> {
        let token = self.token_provider.get_token(correlation_id).await?;
        if token.token.is_empty() {
            return Err(GatewayError::TokenMalformed);
        }

        let base = self
            .backends
            .get(&app.to_ascii_lowercase())
            .ok_or_else(|| GatewayError::MissingConfigData(app.to_string()))?;

        let (parts, body) = req.into_parts();
        let body_kind = BodyKind::extract(&parts.method, &parts.headers, body).await?;
        let target = build_target_uri(base, resource, parts.uri.query());
        let (content_type, payload) = body_kind.encode();

        let mut builder = Request::builder().method(parts.method.clone()).uri(&target);
        if let Some(headers) = builder.headers_mut() {
            for (key, value) in parts.headers.iter() {
                if !is_managed_header(key.as_str()) {
                    headers.insert(key.clone(), value.clone());
                }
            }

            match extract_host_from_url(&target) {
                Some(host) => match host.parse::<HeaderValue>() {
                    Ok(value) => {
                        headers.insert(header::HOST, value);
                    }
                    Err(e) => warn!("target host '{}' is not a valid header value: {}", host, e),
                },
                None => warn!("could not extract host from target URL '{}'", target),
            }

            let bearer = format!("Bearer {}", token.token);
            let authorization = HeaderValue::from_str(&bearer)
                .map_err(|e| GatewayError::DataProcessing(format!("authorization header: {e}")))?;
            headers.insert(header::AUTHORIZATION, authorization);
            headers.insert(API_KEY_HEADER, self.api_key.clone());
            let correlation = HeaderValue::from_str(correlation_id)
                .map_err(|e| GatewayError::DataProcessing(format!("correlation header: {e}")))?;
            headers.insert(&CORRELATION_HEADER, correlation);
            if let Some(content_type) = content_type {
                headers.insert(header::CONTENT_TYPE, content_type);
            }
        }

        let outbound = builder
            .body(Full::new(payload).map_err(|e| match e {}).boxed())
            .map_err(|e| GatewayError::DataProcessing(format!("outbound request: {e}")))?;

        debug!(target = %target, "dispatching to backend");
        let response = tokio::time::timeout(self.timeout, self.client.request(outbound))
            .await
            .map_err(|_| {
                GatewayError::UpstreamDispatchFailure(format!(
                    "no response within {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| GatewayError::UpstreamDispatchFailure(e.to_string()))?;

        // Relay the upstream response verbatim: status, headers, and body.
        let (response_parts, response_body) = response.into_parts();
        let bytes = response_body
            .collect()
            .await
            .map_err(|e| GatewayError::UpstreamDispatchFailure(e.to_string()))?
            .to_bytes();
        Ok(Response::from_parts(response_parts, Body::from(bytes)))
    }
}

/// The axum application: the gateway answers every path via the fallback
/// handler, with permissive CORS on all responses.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .fallback(forward_handler)
        .with_state(gateway)
        .layer(CorsLayer::permissive())
}

async fn forward_handler(
    State(gateway): State<Arc<Gateway>>,
    req: Request<Body>,
) -> Response<Body> {
    gateway.handle(req).await
}
