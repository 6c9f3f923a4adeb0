//! Request context and router: matches `(serviceName, components[0..n])`
//! to a resource family and posts the work onto the engine's
//! single-threaded queue, awaiting the reply.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::Value as JsonValue;

use crate::engine::EngineHandle;
use crate::errors::AppError;
use crate::m1::{self, CreateSessionRequest};
use crate::m5::{self, ConditionalGet, NetworkAssistanceRequest};
use crate::management;
use crate::store::PolicyTemplateState;
use crate::util::etag_for;
use crate::{config::Config, content_protocols};

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub server_name: String,
    pub api_release: String,
    pub sai_cache_control_max_age: u64,
}

fn http_date(when: chrono::DateTime<chrono::Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn build_router(engine: EngineHandle, config: &Config) -> Router {
    let state = AppState {
        engine,
        server_name: config.server_name.clone(),
        api_release: config.api_release.clone(),
        sai_cache_control_max_age: config.sai_cache_control_max_age,
    };

    Router::new()
        .route("/3gpp-m1/v2/provisioning-sessions", post(create_session))
        .route("/3gpp-m1/v2/provisioning-sessions/:id", get(get_session).delete(delete_session))
        .route(
            "/3gpp-m1/v2/provisioning-sessions/:id/content-hosting-configuration",
            put(put_chc).get(get_chc),
        )
        .route("/3gpp-m1/v2/provisioning-sessions/:id/certificates", post(create_certificate))
        .route(
            "/3gpp-m1/v2/provisioning-sessions/:id/certificates/:cert_id",
            get(get_certificate).delete(delete_certificate),
        )
        .route("/3gpp-m1/v2/provisioning-sessions/:id/policy-templates", post(create_policy_template))
        .route(
            "/3gpp-m1/v2/provisioning-sessions/:id/policy-templates/:pt_id",
            get(get_policy_template).put(approve_policy_template).delete(delete_policy_template),
        )
        .route(
            "/3gpp-m1/v2/provisioning-sessions/:id/consumption-reporting-configuration",
            put(put_consumption_config).get(get_consumption_config).delete(delete_consumption_config),
        )
        .route(
            "/3gpp-m1/v2/provisioning-sessions/:id/metrics-reporting-configurations",
            post(create_metrics_config),
        )
        .route(
            "/3gpp-m1/v2/provisioning-sessions/:id/metrics-reporting-configurations/:m_id",
            get(get_metrics_config).delete(delete_metrics_config),
        )
        .route("/3gpp-m1/v2/provisioning-sessions/:id/content-protocols", get(get_content_protocols))
        .route("/3gpp-m5/v2/service-access-information/:id", get(get_sai))
        .route("/3gpp-m5/v2/consumption-reports/:id", post(post_consumption_report))
        .route("/3gpp-m5/v2/metrics-reports/:id/:metrics_id", post(post_metrics_report))
        .route("/3gpp-m5/v2/network-assistance/:id", post(post_network_assistance))
        .route("/3gpp-m5/v2/network-assistance/:id/delivery-boost", post(post_delivery_boost))
        .route("/3gpp-m5/v2/dynamic-policies/:id", post(create_dynamic_policy))
        .route(
            "/3gpp-m5/v2/dynamic-policies/:id/:policy_id",
            get(get_dynamic_policy).put(update_dynamic_policy).delete(delete_dynamic_policy),
        )
        .route("/5gmag-rt-management/v1/provisioning-sessions", get(list_sessions))
        .with_state(state)
}

fn server_header(state: &AppState, resource_family: &str) -> String {
    format!(
        "5GMSdAF-{} ({}/{}) {}/{}",
        state.server_name, resource_family, state.api_release, env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")
    )
}

fn respond(state: &AppState, instance: &str, family: &str, status: StatusCode, body: impl serde::Serialize) -> Response {
    let mut response = (status, Json(body)).into_response();
    if let Ok(value) = server_header(state, family).parse() {
        response.headers_mut().insert("server", value);
    }
    let _ = instance;
    response
}

fn problem(state: &AppState, instance: &str, family: &str, error: AppError) -> Response {
    let mut response = error.into_problem(&state.server_name, &state.api_release, instance);
    if let Ok(value) = server_header(state, family).parse() {
        response.headers_mut().insert("server", value);
    }
    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn create_session(State(state): State<AppState>, Json(req): Json<CreateSessionRequest>) -> Response {
    let result = state.engine.ask(move |engine_state| {
        let result = m1::create_session(engine_state, req);
        async move { result }
    }).await;
    match result {
        Ok((id, body)) => {
            let etag = etag_for(&serde_json::to_vec(&body).unwrap_or_default());
            let mut response = respond(&state, &id, "m1", StatusCode::CREATED, body);
            if let Ok(v) = format!("/3gpp-m1/v2/provisioning-sessions/{id}").parse() {
                response.headers_mut().insert("location", v);
            }
            if let Ok(v) = etag.parse() {
                response.headers_mut().insert("etag", v);
            }
            if let Ok(v) = http_date(chrono::Utc::now()).parse() {
                response.headers_mut().insert("last-modified", v);
            }
            response
        }
        Err(e) => problem(&state, "provisioning-sessions", "m1", e),
    }
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id2 = id.clone();
    let result = state.engine.ask(move |engine_state| {
        let result = m1::get_session(engine_state, &id2);
        async move { result }
    }).await;
    match result {
        Ok(body) => respond(&state, &id, "m1", StatusCode::OK, body),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id2 = id.clone();
    let result = state.engine.ask(move |engine_state| {
        let result = m1::delete_session(engine_state, &id2);
        async move { result }
    }).await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn put_chc(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<JsonValue>,
) -> Response {
    let if_match = header_str(&headers, "if-match").map(str::to_string);
    let id2 = id.clone();
    let result = state.engine.ask(move |engine_state| {
        let result = m1::put_content_hosting_configuration(engine_state, &id2, if_match.as_deref(), body);
        async move { result }
    }).await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn get_chc(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id2 = id.clone();
    let result = state.engine.ask(move |engine_state| {
        let result = m1::get_content_hosting_configuration(engine_state, &id2);
        async move { result }
    }).await;
    match result {
        Ok(body) => respond(&state, &id, "m1", StatusCode::OK, body),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn create_certificate(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let result = m1::submit_create_certificate(&state.engine, id.clone()).await;
    match result {
        Ok(Ok((cert_id, af_unique_id))) => {
            let mut response = respond(
                &state,
                &id,
                "m1",
                StatusCode::CREATED,
                serde_json::json!({ "certificateId": cert_id, "afUniqueCertificateId": af_unique_id }),
            );
            let location = format!("/3gpp-m1/v2/provisioning-sessions/{id}/certificates/{cert_id}");
            if let Ok(v) = location.parse() {
                response.headers_mut().insert("location", v);
            }
            response
        }
        Ok(Err(e)) => problem(&state, &id, "m1", e),
        Err(_) => problem(&state, &id, "m1", AppError::Internal(anyhow::anyhow!("engine dropped reply"))),
    }
}

async fn get_certificate(State(state): State<AppState>, Path((id, cert_id)): Path<(String, String)>) -> Response {
    let (id2, cert_id2) = (id.clone(), cert_id.clone());
    let result = state.engine.ask(move |engine_state| {
        let result = m1::get_certificate_pem(engine_state, &id2, &cert_id2);
        async move { result }
    }).await;
    match result {
        Ok(pem) => {
            let mut response = (StatusCode::OK, pem).into_response();
            if let Ok(v) = "application/x-pem-file".parse() {
                response.headers_mut().insert("content-type", v);
            }
            response
        }
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn delete_certificate(State(state): State<AppState>, Path((id, cert_id)): Path<(String, String)>) -> Response {
    let result = m1::submit_delete_certificate(&state.engine, id.clone(), cert_id).await;
    match result {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => problem(&state, &id, "m1", e),
        Err(_) => problem(&state, &id, "m1", AppError::Internal(anyhow::anyhow!("engine dropped reply"))),
    }
}

async fn create_policy_template(State(state): State<AppState>, Path(id): Path<String>, Json(document): Json<JsonValue>) -> Response {
    let id2 = id.clone();
    let result = state.engine.ask(move |engine_state| {
        let result = m1::create_policy_template(engine_state, &id2, document);
        async move { result }
    }).await;
    match result {
        Ok(body) => respond(&state, &id, "m1", StatusCode::CREATED, body),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn get_policy_template(State(state): State<AppState>, Path((id, pt_id)): Path<(String, String)>) -> Response {
    let (id2, pt_id2) = (id.clone(), pt_id.clone());
    let result = state.engine.ask(move |engine_state| {
        let result = m1::get_policy_template(engine_state, &id2, &pt_id2);
        async move { result }
    }).await;
    match result {
        Ok(body) => respond(&state, &id, "m1", StatusCode::OK, body),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

#[derive(serde::Deserialize)]
struct PolicyTemplateApproval {
    state: String,
}

async fn approve_policy_template(
    State(state): State<AppState>,
    Path((id, pt_id)): Path<(String, String)>,
    Json(body): Json<PolicyTemplateApproval>,
) -> Response {
    let new_state = match body.state.as_str() {
        "valid" => PolicyTemplateState::Valid,
        "invalid" => PolicyTemplateState::Invalid,
        _ => {
            return problem(&state, &id, "m1", AppError::validation("state must be valid or invalid"));
        }
    };
    let (id2, pt_id2) = (id.clone(), pt_id.clone());
    let result = state.engine.ask(move |engine_state| {
        let result = m1::set_policy_template_state(engine_state, &id2, &pt_id2, new_state);
        async move { result }
    }).await;
    match result {
        Ok(body) => respond(&state, &id, "m1", StatusCode::OK, body),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn delete_policy_template(State(state): State<AppState>, Path((id, pt_id)): Path<(String, String)>) -> Response {
    let (id2, pt_id2) = (id.clone(), pt_id.clone());
    let result = state.engine.ask(move |engine_state| {
        let result = m1::delete_policy_template(engine_state, &id2, &pt_id2);
        async move { result }
    }).await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn put_consumption_config(State(state): State<AppState>, Path(id): Path<String>, Json(document): Json<JsonValue>) -> Response {
    let id2 = id.clone();
    let result = state.engine.ask(move |engine_state| {
        let result = m1::put_consumption_reporting_configuration(engine_state, &id2, document);
        async move { result }
    }).await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn get_consumption_config(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id2 = id.clone();
    let result = state.engine.ask(move |engine_state| {
        let result = m1::get_consumption_reporting_configuration(engine_state, &id2);
        async move { result }
    }).await;
    match result {
        Ok(body) => respond(&state, &id, "m1", StatusCode::OK, body),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn delete_consumption_config(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id2 = id.clone();
    let result = state.engine.ask(move |engine_state| {
        let result = m1::delete_consumption_reporting_configuration(engine_state, &id2);
        async move { result }
    }).await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn create_metrics_config(State(state): State<AppState>, Path(id): Path<String>, Json(document): Json<JsonValue>) -> Response {
    let id2 = id.clone();
    let result = state.engine.ask(move |engine_state| {
        let result = m1::create_metrics_reporting_configuration(engine_state, &id2, document);
        async move { result }
    }).await;
    match result {
        Ok(body) => respond(&state, &id, "m1", StatusCode::CREATED, body),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn get_metrics_config(State(state): State<AppState>, Path((id, m_id)): Path<(String, String)>) -> Response {
    let (id2, m_id2) = (id.clone(), m_id.clone());
    let result = state.engine.ask(move |engine_state| {
        let result = m1::get_metrics_reporting_configuration(engine_state, &id2, &m_id2);
        async move { result }
    }).await;
    match result {
        Ok(body) => respond(&state, &id, "m1", StatusCode::OK, body),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn delete_metrics_config(State(state): State<AppState>, Path((id, m_id)): Path<(String, String)>) -> Response {
    let (id2, m_id2) = (id.clone(), m_id.clone());
    let result = state.engine.ask(move |engine_state| {
        let result = m1::delete_metrics_reporting_configuration(engine_state, &id2, &m_id2);
        async move { result }
    }).await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => problem(&state, &id, "m1", e),
    }
}

async fn get_content_protocols(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let document = content_protocols::document();
    if let Some(value) = header_str(&headers, "if-none-match") {
        if crate::util::etag_matches(value, &document.etag) {
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }
    let mut response = (StatusCode::OK, document.body).into_response();
    if let Ok(v) = document.etag.parse() {
        response.headers_mut().insert("etag", v);
    }
    if let Ok(v) = http_date(document.last_modified).parse() {
        response.headers_mut().insert("last-modified", v);
    }
    if let Ok(v) = server_header(&state, "m1").parse() {
        response.headers_mut().insert("server", v);
    }
    response
}

async fn get_sai(State(state): State<AppState>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    let if_none_match = header_str(&headers, "if-none-match").map(str::to_string);
    let id2 = id.clone();
    let result = state.engine.ask(move |engine_state| {
        let result = m5::get_service_access_information(engine_state, &id2, if_none_match.as_deref());
        async move { result }
    }).await;
    match result {
        Ok(ConditionalGet::NotModified) => StatusCode::NOT_MODIFIED.into_response(),
        Ok(ConditionalGet::Ok(document)) => {
            let mut response = respond(&state, &id, "m5", StatusCode::OK, document.body);
            if let Ok(v) = document.etag.parse() {
                response.headers_mut().insert("etag", v);
            }
            if let Ok(v) = http_date(document.last_modified).parse() {
                response.headers_mut().insert("last-modified", v);
            }
            if let Ok(v) = format!("max-age={}", state.sai_cache_control_max_age).parse() {
                response.headers_mut().insert("cache-control", v);
            }
            response
        }
        Err(e) => problem(&state, &id, "m5", e),
    }
}

async fn post_consumption_report(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<JsonValue>) -> Response {
    let result = m5::submit_consumption_report(&state.engine, id.clone(), body).await;
    match result {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => problem(&state, &id, "m5", e),
        Err(_) => problem(&state, &id, "m5", AppError::Internal(anyhow::anyhow!("engine dropped reply"))),
    }
}

async fn post_metrics_report(
    State(state): State<AppState>,
    Path((id, metrics_id)): Path<(String, String)>,
    Json(body): Json<JsonValue>,
) -> Response {
    let result = m5::submit_metrics_report(&state.engine, id.clone(), metrics_id, body).await;
    match result {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => problem(&state, &id, "m5", e),
        Err(_) => problem(&state, &id, "m5", AppError::Internal(anyhow::anyhow!("engine dropped reply"))),
    }
}

async fn post_network_assistance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<NetworkAssistanceRequest>,
) -> Response {
    let result = m5::submit_network_assistance(&state.engine, id.clone(), req).await;
    match result {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => problem(&state, &id, "m5", e),
        Err(_) => problem(&state, &id, "m5", AppError::Internal(anyhow::anyhow!("engine dropped reply"))),
    }
}

#[derive(serde::Deserialize)]
struct DeliveryBoostRequest {
    #[serde(rename = "clientId")]
    client_id: String,
}

async fn post_delivery_boost(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DeliveryBoostRequest>,
) -> Response {
    let boost_seconds = {
        let (tx, rx) = tokio::sync::oneshot::channel();
        state.engine.submit(move |engine_state| {
            let seconds = engine_state.config.network_assistance.delivery_boost_seconds;
            let _ = tx.send(seconds);
            std::future::ready(())
        });
        rx.await.unwrap_or(20)
    };
    let result = m5::submit_delivery_boost(&state.engine, id.clone(), req.client_id, boost_seconds).await;
    match result {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => problem(&state, &id, "m5", e),
        Err(_) => problem(&state, &id, "m5", AppError::Internal(anyhow::anyhow!("engine dropped reply"))),
    }
}

async fn create_dynamic_policy(State(state): State<AppState>, Path(id): Path<String>, Json(document): Json<JsonValue>) -> Response {
    let id2 = id.clone();
    let result = state.engine.ask(move |engine_state| {
        let result = m5::create_dynamic_policy(engine_state, &id2, document);
        async move { result }
    }).await;
    match result {
        Ok(body) => respond(&state, &id, "m5", StatusCode::CREATED, body),
        Err(e) => problem(&state, &id, "m5", e),
    }
}

async fn get_dynamic_policy(State(state): State<AppState>, Path((id, policy_id)): Path<(String, String)>) -> Response {
    let (id2, policy_id2) = (id.clone(), policy_id.clone());
    let result = state.engine.ask(move |engine_state| {
        let result = m5::get_dynamic_policy(engine_state, &id2, &policy_id2);
        async move { result }
    }).await;
    match result {
        Ok(body) => respond(&state, &id, "m5", StatusCode::OK, body),
        Err(e) => problem(&state, &id, "m5", e),
    }
}

async fn update_dynamic_policy(
    State(state): State<AppState>,
    Path((id, policy_id)): Path<(String, String)>,
    Json(document): Json<JsonValue>,
) -> Response {
    let (id2, policy_id2) = (id.clone(), policy_id.clone());
    let result = state.engine.ask(move |engine_state| {
        let result = m5::update_dynamic_policy(engine_state, &id2, &policy_id2, document);
        async move { result }
    }).await;
    match result {
        Ok(body) => respond(&state, &id, "m5", StatusCode::OK, body),
        Err(e) => problem(&state, &id, "m5", e),
    }
}

async fn delete_dynamic_policy(State(state): State<AppState>, Path((id, policy_id)): Path<(String, String)>) -> Response {
    let (id2, policy_id2) = (id.clone(), policy_id.clone());
    let result = state.engine.ask(move |engine_state| {
        let result = m5::delete_dynamic_policy(engine_state, &id2, &policy_id2);
        async move { result }
    }).await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => problem(&state, &id, "m5", e),
    }
}

async fn list_sessions(State(state): State<AppState>) -> Response {
    let ids = state.engine.ask(|engine_state| {
        let ids = management::list_provisioning_session_ids(engine_state);
        async move { ids }
    }).await;
    respond(&state, "provisioning-sessions", "management", StatusCode::OK, ids)
}

