//! End-to-end exercises of the M1/M3/M5 control plane through the real
//! axum router, a real engine, and small local mock servers standing in
//! for Application Servers/PCF/BSF.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::routing::{get, post, put};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use rt_5gms_af::cert_manager::StubCertificateManager;
use rt_5gms_af::config::{ApplicationServerConfig, Config};
use rt_5gms_af::engine::Engine;
use rt_5gms_af::http::router::build_router;

async fn send_request(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let request = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        builder.body(Body::from(serde_json::to_string(&body).unwrap())).unwrap()
    } else {
        builder.body(Body::empty()).unwrap()
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() { json!({}) } else { serde_json::from_slice(&bytes).unwrap_or(json!({})) };
    (status, headers, json)
}

fn send_request_with_header(app: &Router, method: Method, uri: &str, header: (&str, &str), body: Option<Value>) -> impl std::future::Future<Output = (StatusCode, axum::http::HeaderMap, Value)> {
    let mut builder = Request::builder().method(method).uri(uri).header(header.0, header.1);
    let request = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        builder.body(Body::from(serde_json::to_string(&body).unwrap())).unwrap()
    } else {
        builder.body(Body::empty()).unwrap()
    };
    let app = app.clone();
    async move {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() { json!({}) } else { serde_json::from_slice(&bytes).unwrap_or(json!({})) };
        (status, headers, json)
    }
}

/// A minimal stand-in for an Application Server's M3 surface. Records every
/// request it sees so tests can assert on reconciliation traffic.
#[derive(Clone, Default)]
struct MockAsLog(Arc<Mutex<Vec<String>>>);

impl MockAsLog {
    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

async fn spawn_mock_as() -> (String, u16, MockAsLog) {
    let log = MockAsLog::default();

    async fn get_certificates() -> axum::Json<Vec<String>> {
        axum::Json(vec![])
    }
    async fn get_chcs() -> axum::Json<Vec<String>> {
        axum::Json(vec![])
    }
    async fn accept() -> StatusCode {
        StatusCode::NO_CONTENT
    }

    let app = Router::new()
        .route("/3gpp-m3/v1/certificates", get(get_certificates))
        .route("/3gpp-m3/v1/certificates/:id", put(accept).post(accept).delete(accept))
        .route("/3gpp-m3/v1/content-hosting-configurations", get(get_chcs))
        .route(
            "/3gpp-m3/v1/content-hosting-configurations/:id",
            put(accept).post(accept).delete(accept),
        )
        .route("/3gpp-m3/v1/content-hosting-configurations/:id/purge", post(accept))
        .layer(axum::middleware::from_fn_with_state(log.clone(), |state: axum::extract::State<MockAsLog>, req: Request<Body>, next: axum::middleware::Next| {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            state.0.0.lock().unwrap().push(format!("{method} {path}"));
            next.run(req)
        }))
        .with_state(());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    ("127.0.0.1".to_string(), port, log)
}

fn config_with_as(hostname: &str, port: u16) -> Config {
    let mut config = Config::default();
    config.application_servers.push(ApplicationServerConfig {
        canonical_hostname: hostname.to_string(),
        url_path_prefix_format: "/{ps}/".to_string(),
        m3_port: port,
    });
    config
}

async fn test_app(config: Config) -> Router {
    let (engine, handle) = Engine::new(config.clone(), Arc::new(StubCertificateManager::default()));
    tokio::spawn(engine.run());
    build_router(handle, &config)
}

#[tokio::test]
async fn creating_a_provisioning_session_returns_201_with_location() {
    let app = test_app(Config::default()).await;
    let (status, headers, body) = send_request(
        &app,
        Method::POST,
        "/3gpp-m1/v2/provisioning-sessions",
        Some(json!({
            "provisioningSessionType": "DOWNLINK",
            "appId": "app1",
            "aspId": "asp1",
        })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    let location = headers.get("location").unwrap().to_str().unwrap();
    let id = body["provisioningSessionId"].as_str().unwrap();
    assert!(location.ends_with(id));
    assert!(headers.get("etag").is_some());
}

#[tokio::test]
async fn creating_a_certificate_mints_af_unique_id_and_reaches_the_as() {
    let (hostname, port, as_log) = spawn_mock_as().await;
    let config = config_with_as(&hostname, port);
    let app = test_app(config).await;

    let (_, _, session) = send_request(
        &app,
        Method::POST,
        "/3gpp-m1/v2/provisioning-sessions",
        Some(json!({ "provisioningSessionType": "DOWNLINK", "appId": "app1", "aspId": "asp1" })),
    )
    .await;
    let ps_id = session["provisioningSessionId"].as_str().unwrap().to_string();

    let (status, _, cert) = send_request(
        &app,
        Method::POST,
        &format!("/3gpp-m1/v2/provisioning-sessions/{ps_id}/certificates"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let af_unique_id = cert["afUniqueCertificateId"].as_str().unwrap();
    assert_eq!(af_unique_id, format!("{ps_id}:{}", cert["certificateId"].as_str().unwrap()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let entries = as_log.entries();
    assert!(entries.iter().any(|e| e.starts_with("POST /3gpp-m3/v1/certificates/")), "entries: {entries:?}");
}

#[tokio::test]
async fn chc_with_unknown_certificate_reference_is_rejected_without_as_traffic() {
    let (hostname, port, as_log) = spawn_mock_as().await;
    let config = config_with_as(&hostname, port);
    let app = test_app(config).await;

    let (_, _, session) = send_request(
        &app,
        Method::POST,
        "/3gpp-m1/v2/provisioning-sessions",
        Some(json!({ "provisioningSessionType": "DOWNLINK", "appId": "app1", "aspId": "asp1" })),
    )
    .await;
    let ps_id = session["provisioningSessionId"].as_str().unwrap().to_string();

    let (status, _, body) = send_request(
        &app,
        Method::PUT,
        &format!("/3gpp-m1/v2/provisioning-sessions/{ps_id}/content-hosting-configuration"),
        Some(json!({ "distributionConfigurations": [{ "certificateId": "missing" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["invalidParams"].is_array());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(as_log.entries().iter().all(|e| !e.contains("content-hosting-configurations/")));
}

#[tokio::test]
async fn sai_conditional_get_transitions_from_not_modified_to_ok_after_chc_put() {
    let app = test_app(Config::default()).await;
    let (_, _, session) = send_request(
        &app,
        Method::POST,
        "/3gpp-m1/v2/provisioning-sessions",
        Some(json!({ "provisioningSessionType": "DOWNLINK", "appId": "app1", "aspId": "asp1" })),
    )
    .await;
    let ps_id = session["provisioningSessionId"].as_str().unwrap().to_string();

    let (status, headers, _) = send_request(&app, Method::GET, &format!("/3gpp-m5/v2/service-access-information/{ps_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let etag = headers.get("etag").unwrap().to_str().unwrap().to_string();

    let (status, _, _) = send_request_with_header(
        &app,
        Method::GET,
        &format!("/3gpp-m5/v2/service-access-information/{ps_id}"),
        ("if-none-match", &etag),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);

    send_request(
        &app,
        Method::PUT,
        &format!("/3gpp-m1/v2/provisioning-sessions/{ps_id}/content-hosting-configuration"),
        Some(json!({ "distributionConfigurations": [] })),
    )
    .await;

    let (status, headers, _) = send_request_with_header(
        &app,
        Method::GET,
        &format!("/3gpp-m5/v2/service-access-information/{ps_id}"),
        ("if-none-match", &etag),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(headers.get("etag").unwrap().to_str().unwrap(), etag);
}

#[tokio::test]
async fn delivery_boost_without_a_configured_target_is_rejected() {
    let app = test_app(Config::default()).await;
    let (_, _, session) = send_request(
        &app,
        Method::POST,
        "/3gpp-m1/v2/provisioning-sessions",
        Some(json!({ "provisioningSessionType": "DOWNLINK", "appId": "app1", "aspId": "asp1" })),
    )
    .await;
    let ps_id = session["provisioningSessionId"].as_str().unwrap().to_string();

    // A session created without a boostedPolicyTemplateId has nothing a
    // boost could switch to, so the FSM rejects it before any PCF session
    // needs to exist - this exercises the guard without requiring a live PCF.
    let (status, _, _) = send_request(
        &app,
        Method::POST,
        &format!("/3gpp-m5/v2/network-assistance/{ps_id}/delivery-boost"),
        Some(json!({ "clientId": "client1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unreachable_as_does_not_block_a_reachable_one() {
    let (hostname, port, reachable_log) = spawn_mock_as().await;
    let mut config = config_with_as(&hostname, port);
    // Distinct canonical_hostname from the reachable entry above: the store
    // keys AS-state nodes by hostname, so two entries sharing one would
    // collapse onto a single node instead of giving us two to reconcile.
    config.application_servers.push(ApplicationServerConfig {
        canonical_hostname: "127.0.0.2".to_string(),
        url_path_prefix_format: "/{ps}/".to_string(),
        m3_port: 1,
    });
    let app = test_app(config).await;

    let (_, _, session) = send_request(
        &app,
        Method::POST,
        "/3gpp-m1/v2/provisioning-sessions",
        Some(json!({ "provisioningSessionType": "DOWNLINK", "appId": "app1", "aspId": "asp1" })),
    )
    .await;
    let ps_id = session["provisioningSessionId"].as_str().unwrap().to_string();

    send_request(
        &app,
        Method::PUT,
        &format!("/3gpp-m1/v2/provisioning-sessions/{ps_id}/content-hosting-configuration"),
        Some(json!({ "distributionConfigurations": [] })),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    let entries = reachable_log.entries();
    assert!(
        entries.iter().any(|e| e.contains("content-hosting-configurations")),
        "reachable AS never saw the CHC push: {entries:?}"
    );
}
