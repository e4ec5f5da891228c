//! Integration tests for the gateway pipeline
//!
//! These tests drive the router directly and stand up real fake issuer and
//! backend servers on ephemeral ports, so allow-list short-circuits and
//! upstream invocation counts can be asserted precisely.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bridge_gateway::config::GatewayConfig;
use bridge_gateway::correlation::CORRELATION_HEADER;
use bridge_gateway::gateway::{self, Gateway};
use bridge_gateway::metrics::GatewayMetrics;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

/// Fake token issuer state
#[derive(Clone)]
struct IssuerState {
    calls: Arc<AtomicUsize>,
    token: String,
    status: u16,
}

async fn issue_token(State(state): State<IssuerState>) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    if state.status != 200 {
        return StatusCode::from_u16(state.status).unwrap().into_response();
    }
    Json(json!({"token": state.token, "expiryInSeconds": 300})).into_response()
}

/// Spawn a fake issuer; returns its address and an invocation counter.
async fn spawn_issuer(token: &str, status: u16) -> (SocketAddr, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let state = IssuerState {
        calls: calls.clone(),
        token: token.to_string(),
        status,
    };
    let app = Router::new()
        .route("/api/Application/get/token", post(issue_token))
        .with_state(state);
    (spawn(app).await, calls)
}

/// What a fake backend saw
struct CapturedRequest {
    method: Method,
    path_and_query: String,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Clone)]
struct BackendState {
    calls: Arc<AtomicUsize>,
    captured: Arc<Mutex<Option<CapturedRequest>>>,
}

/// Fake backend: records the request and answers 418 with a marker header.
async fn backend_handler(State(state): State<BackendState>, req: Request<Body>) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    *state.captured.lock().unwrap() = Some(CapturedRequest {
        method: parts.method,
        path_and_query: parts
            .uri
            .path_and_query()
            .map(|p| p.to_string())
            .unwrap_or_default(),
        headers: parts.headers,
        body: bytes,
    });
    (StatusCode::IM_A_TEAPOT, [("x-upstream", "yes")], "teapot").into_response()
}

async fn spawn_backend() -> (SocketAddr, BackendState) {
    let state = BackendState {
        calls: Arc::new(AtomicUsize::new(0)),
        captured: Arc::new(Mutex::new(None)),
    };
    let app = Router::new()
        .fallback(backend_handler)
        .with_state(state.clone());
    (spawn(app).await, state)
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Build a gateway router wired to the given fake issuer and backends.
fn gateway_app(issuer: SocketAddr, backends: &[(&str, SocketAddr)], cache: bool) -> Router {
    let backends_toml: String = backends
        .iter()
        .map(|(name, addr)| format!("{name} = \"http://{addr}\"\n"))
        .collect();
    let toml = format!(
        r#"
api_key = "test-api-key"
router_name = "bridge-test"

[server]
timeout = 5

[token_issuer]
base_address = "http://{issuer}"
cache_enabled = {cache}

[backends]
{backends_toml}
"#
    );
    let config = GatewayConfig::parse(&toml).unwrap();
    let gateway = Gateway::new(&config, Arc::new(GatewayMetrics::new())).unwrap();
    gateway::router(Arc::new(gateway))
}

async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_bypasses_all_upstreams() {
    let (issuer, issuer_calls) = spawn_issuer("tok", 200).await;
    let app = gateway_app(issuer, &[], false);

    let before = chrono::Utc::now();
    let response = app.oneshot(get("/health")).await.unwrap();
    let after = chrono::Utc::now();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "Healthy");
    let checked_at = chrono::DateTime::parse_from_rfc3339(body["checkedAt"].as_str().unwrap())
        .unwrap()
        .with_timezone(&chrono::Utc);
    assert!(checked_at >= before && checked_at <= after);
    assert_eq!(issuer_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_path_is_rejected_with_envelope() {
    let (issuer, issuer_calls) = spawn_issuer("tok", 200).await;
    let app = gateway_app(issuer, &[], false);

    let response = app.oneshot(get("/whatever/else")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.headers().contains_key(&CORRELATION_HEADER));

    let body = body_json(response).await;
    assert!(body["errorCode"].is_number());
    assert!(body["message"].is_string());
    assert!(body["details"].is_string());
    assert_eq!(issuer_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_path_is_a_bad_request() {
    let (issuer, _) = spawn_issuer("tok", 200).await;
    let app = gateway_app(issuer, &[], false);

    let response = app.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["errorCode"], 1005);
}

#[tokio::test]
async fn disallowed_resource_short_circuits_before_any_upstream() {
    let (issuer, issuer_calls) = spawn_issuer("tok", 200).await;
    let (backend, backend_state) = spawn_backend().await;
    let app = gateway_app(issuer, &[("users", backend)], false);

    let response = app.oneshot(get("/Secure/users/admin/panel")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(issuer_calls.load(Ordering::SeqCst), 0);
    assert_eq!(backend_state.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_backend_config_is_a_server_error() {
    let (issuer, issuer_calls) = spawn_issuer("tok", 200).await;
    let (backend, backend_state) = spawn_backend().await;
    let app = gateway_app(issuer, &[("users", backend)], false);

    let response = app.oneshot(get("/Secure/ghost/Users/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["errorCode"], 1011);
    // The token is acquired before the backend address is resolved; the
    // backend itself is never called.
    assert_eq!(issuer_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend_state.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_token_yields_unauthorized_without_backend_call() {
    let (issuer, _) = spawn_issuer("", 200).await;
    let (backend, backend_state) = spawn_backend().await;
    let app = gateway_app(issuer, &[("users", backend)], false);

    let response = app.oneshot(get("/Secure/users/Users/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["errorCode"], 1009);
    assert_eq!(backend_state.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn issuer_refusal_surfaces_as_unauthorized() {
    let (issuer, _) = spawn_issuer("tok", 401).await;
    let (backend, backend_state) = spawn_backend().await;
    let app = gateway_app(issuer, &[("users", backend)], false);

    let response = app.oneshot(get("/Secure/users/Users/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(backend_state.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn backend_transport_failure_is_a_server_error() {
    let (issuer, _) = spawn_issuer("tok", 200).await;
    // Nothing listens on the backend address.
    let app = gateway_app(issuer, &[("users", "127.0.0.1:9".parse().unwrap())], false);

    let response = app.oneshot(get("/Secure/users/Users/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["errorCode"], 1013);
}

#[tokio::test]
async fn successful_call_relays_status_headers_and_body() {
    let (issuer, _) = spawn_issuer("test-token", 200).await;
    let (backend, backend_state) = spawn_backend().await;
    let app = gateway_app(issuer, &[("users", backend)], false);

    let request = Request::builder()
        .uri("/Secure/users/Users/42")
        .header(&CORRELATION_HEADER, "corr-7")
        .header("x-caller", "integration")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(response.headers()["x-upstream"], "yes");
    assert_eq!(response.headers()[&CORRELATION_HEADER], "corr-7");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"teapot".as_slice());

    let captured = backend_state.captured.lock().unwrap();
    let seen = captured.as_ref().expect("backend should have been called");
    assert_eq!(seen.method, Method::GET);
    assert_eq!(seen.path_and_query, "/Users/42");
    assert_eq!(seen.headers["authorization"], "Bearer test-token");
    assert_eq!(seen.headers["apikey"], "test-api-key");
    assert_eq!(seen.headers[&CORRELATION_HEADER], "corr-7");
    assert_eq!(seen.headers["x-caller"], "integration");
}

#[tokio::test]
async fn query_string_is_reencoded_in_order() {
    let (issuer, _) = spawn_issuer("tok", 200).await;
    let (backend, backend_state) = spawn_backend().await;
    let app = gateway_app(issuer, &[("users", backend)], false);

    let response = app
        .oneshot(get("/Secure/users/Users/42?a=1&b=hello%20world&b=2"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);

    let captured = backend_state.captured.lock().unwrap();
    let seen = captured.as_ref().unwrap();
    assert_eq!(seen.path_and_query, "/Users/42?a=1&b=hello%20world&b=2");
}

#[tokio::test]
async fn correlation_id_is_generated_when_absent() {
    let (issuer, _) = spawn_issuer("tok", 200).await;
    let (backend, backend_state) = spawn_backend().await;
    let app = gateway_app(issuer, &[("users", backend)], false);

    let response = app.oneshot(get("/Secure/users/Users/42")).await.unwrap();
    let relayed = response.headers()[&CORRELATION_HEADER]
        .to_str()
        .unwrap()
        .to_string();
    assert!(!relayed.is_empty());

    let captured = backend_state.captured.lock().unwrap();
    let seen = captured.as_ref().unwrap();
    assert_eq!(seen.headers[&CORRELATION_HEADER].to_str().unwrap(), relayed);
}

#[tokio::test]
async fn multipart_body_is_reencoded_part_for_part() {
    let (issuer, _) = spawn_issuer("tok", 200).await;
    let (backend, backend_state) = spawn_backend().await;
    let app = gateway_app(issuer, &[("users", backend)], false);

    let inbound_body = "--XBOUNDARY\r\n\
        Content-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        hi\r\n\
        --XBOUNDARY\r\n\
        Content-Disposition: form-data; name=\"x\"\r\n\
        \r\n\
        y\r\n\
        --XBOUNDARY--\r\n";
    let request = Request::builder()
        .method(Method::POST)
        .uri("/Secure/users/Users/Create")
        .header("content-type", "multipart/form-data; boundary=XBOUNDARY")
        .body(Body::from(inbound_body))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);

    let captured = backend_state.captured.lock().unwrap();
    let seen = captured.as_ref().unwrap();
    let content_type = seen.headers["content-type"].to_str().unwrap();
    let boundary = content_type
        .strip_prefix("multipart/form-data; boundary=")
        .expect("outbound body should be multipart");

    let expected = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         hi\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"x\"\r\n\
         \r\n\
         y\r\n\
         --{boundary}--\r\n"
    );
    assert_eq!(String::from_utf8(seen.body.to_vec()).unwrap(), expected);
}

#[tokio::test]
async fn json_body_is_forwarded_verbatim() {
    let (issuer, _) = spawn_issuer("tok", 200).await;
    let (backend, backend_state) = spawn_backend().await;
    let app = gateway_app(issuer, &[("users", backend)], false);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/Secure/users/Users/Create")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"name":"ada"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);

    let captured = backend_state.captured.lock().unwrap();
    let seen = captured.as_ref().unwrap();
    assert_eq!(seen.headers["content-type"], "application/json");
    assert_eq!(&seen.body[..], br#"{"name":"ada"}"#.as_slice());
}

#[tokio::test]
async fn anonymous_route_targets_the_fixed_login_route() {
    let (issuer, _) = spawn_issuer("tok", 200).await;
    let (backend, backend_state) = spawn_backend().await;
    let app = gateway_app(issuer, &[("auth", backend)], false);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/Anonymous/Authenticate")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"user":"u","password":"p"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);

    let captured = backend_state.captured.lock().unwrap();
    let seen = captured.as_ref().unwrap();
    assert_eq!(seen.method, Method::POST);
    assert_eq!(seen.path_and_query, "/api/Users/authenticate");
    assert_eq!(&seen.body[..], br#"{"user":"u","password":"p"}"#.as_slice());
}

#[tokio::test]
async fn token_cache_reuses_tokens_until_expiry() {
    let (issuer, issuer_calls) = spawn_issuer("tok", 200).await;
    let (backend, _) = spawn_backend().await;
    let app = gateway_app(issuer, &[("users", backend)], true);

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(get("/Secure/users/Users/42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }
    assert_eq!(issuer_calls.load(Ordering::SeqCst), 1);
}
