//! M5 FSM: the service-access API surface a media client drives — Service
//! Access Information, consumption/metrics reports, dynamic policies and
//! network assistance.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as Json;
use tokio::sync::oneshot;

use crate::engine::{EngineHandle, EngineState};
use crate::errors::{AppError, AppResult};
use crate::m1;
use crate::pcf;
use crate::store::{PolicyTemplateState, SaiDocument};
use crate::util::{etag_matches, new_id};

pub enum ConditionalGet {
    NotModified,
    Ok(SaiDocument),
}

/// SAI GET with conditional-request support.
pub fn get_service_access_information(
    state: &mut EngineState,
    ps_id: &str,
    if_none_match: Option<&str>,
) -> AppResult<ConditionalGet> {
    let document = state.store.sai_for(ps_id)?;
    if let Some(header) = if_none_match {
        if etag_matches(header, &document.etag) {
            return Ok(ConditionalGet::NotModified);
        }
    }
    Ok(ConditionalGet::Ok(document))
}

fn report_path(base: &std::path::Path, kind: &str, ps_id: &str) -> std::path::PathBuf {
    base.join(kind).join(ps_id).join(format!("{}.json", new_id()))
}

async fn write_report(path: std::path::PathBuf, body: &Json) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| AppError::Internal(e.into()))?;
    }
    let bytes = serde_json::to_vec_pretty(body).map_err(|e| AppError::Internal(e.into()))?;
    tokio::fs::write(&path, bytes).await.map_err(|e| AppError::Internal(e.into()))?;
    Ok(())
}

/// Validate a consumption report against the PS's reporting configuration
/// and write it to `dataCollectionDir`.
pub fn submit_consumption_report(handle: &EngineHandle, ps_id: String, body: Json) -> oneshot::Receiver<AppResult<()>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    handle.submit(move |state| {
        let validation = (|| -> AppResult<std::path::PathBuf> {
            let session = state.store.get_session(&ps_id)?;
            if session.consumption_reporting.is_none() {
                return Err(AppError::validation("no consumption-reporting-configuration for this session"));
            }
            Ok(report_path(&state.config.data_collection_dir, "consumption", &ps_id))
        })();
        async move {
            let result = match validation {
                Ok(path) => write_report(path, &body).await,
                Err(e) => Err(e),
            };
            let _ = reply_tx.send(result);
        }
    });
    reply_rx
}

pub fn submit_metrics_report(
    handle: &EngineHandle,
    ps_id: String,
    metrics_reporting_configuration_id: String,
    body: Json,
) -> oneshot::Receiver<AppResult<()>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    handle.submit(move |state| {
        let validation = (|| -> AppResult<std::path::PathBuf> {
            let session = state.store.get_session(&ps_id)?;
            if !session.metrics_reporting.contains_key(&metrics_reporting_configuration_id) {
                return Err(AppError::not_found("metrics-reporting-configuration", &metrics_reporting_configuration_id));
            }
            Ok(report_path(&state.config.data_collection_dir, "metrics", &ps_id))
        })();
        async move {
            let result = match validation {
                Ok(path) => write_report(path, &body).await,
                Err(e) => Err(e),
            };
            let _ = reply_tx.send(result);
        }
    });
    reply_rx
}

/// Dynamic policies operate directly on the PS's policy-template set;
/// these just re-export the M1 operations under the M5 resource name.
pub fn create_dynamic_policy(state: &mut EngineState, ps_id: &str, document: Json) -> AppResult<Json> {
    m1::create_policy_template(state, ps_id, document)
}

pub fn get_dynamic_policy(state: &EngineState, ps_id: &str, policy_id: &str) -> AppResult<Json> {
    m1::get_policy_template(state, ps_id, policy_id)
}

pub fn update_dynamic_policy(state: &mut EngineState, ps_id: &str, policy_id: &str, document: Json) -> AppResult<Json> {
    m1::update_policy_template_document(state, ps_id, policy_id, document)
}

pub fn delete_dynamic_policy(state: &mut EngineState, ps_id: &str, policy_id: &str) -> AppResult<()> {
    m1::delete_policy_template(state, ps_id, policy_id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAssistanceRequest {
    pub client_id: String,
    pub ue_ipv4: String,
    pub policy_template_id: String,
}

fn session_key(ps_id: &str, client_id: &str) -> String {
    format!("{ps_id}:{client_id}")
}

/// Entry point for Network Assistance: resolve the requested policy
/// template on the PS and establish (or reuse) the PCF session for it.
pub fn submit_network_assistance(
    handle: &EngineHandle,
    ps_id: String,
    req: NetworkAssistanceRequest,
) -> oneshot::Receiver<AppResult<()>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let handle2 = handle.clone();
    handle.submit(move |state| {
        let lookup = (|| -> AppResult<Json> {
            let session = state.store.get_session(&ps_id)?;
            let template = session
                .policy_templates
                .get(&req.policy_template_id)
                .filter(|t| t.state == PolicyTemplateState::Valid)
                .ok_or_else(|| AppError::validation("unknown or non-valid policyTemplateId"))?;
            Ok(template.document.clone())
        })();
        async move {
            let result = match lookup {
                Ok(document) => {
                    let key = session_key(&ps_id, &req.client_id);
                    let establish_rx = pcf::submit_establish_session(&handle2, key, req.ue_ipv4, req.policy_template_id, document);
                    establish_rx.await.unwrap_or_else(|_| Err(AppError::Internal(anyhow::anyhow!("engine dropped reply"))))
                }
                Err(e) => Err(e),
            };
            let _ = reply_tx.send(result);
        }
    });
    reply_rx
}

/// `…/delivery-boost` POST: switch to the PS's configured boost template
/// for `boost_seconds`, rejecting a second concurrent boost with a
/// conflict.
pub fn submit_delivery_boost(
    handle: &EngineHandle,
    ps_id: String,
    client_id: String,
    boost_seconds: u64,
) -> oneshot::Receiver<AppResult<()>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let handle2 = handle.clone();
    handle.submit(move |state| {
        let lookup = (|| -> AppResult<(String, Json, Json)> {
            let session = state.store.get_session(&ps_id)?;
            let boosted_id = session
                .boosted_policy_template_id
                .clone()
                .ok_or_else(|| AppError::validation("session has no boostedPolicyTemplateId configured"))?;
            let boosted_doc = session
                .policy_templates
                .get(&boosted_id)
                .ok_or_else(|| AppError::validation("boostedPolicyTemplateId does not resolve on this session"))?
                .document
                .clone();
            let key = session_key(&ps_id, &client_id);
            let original_doc = state
                .pcf_sessions
                .get(&key)
                .and_then(|s| session.policy_templates.get(&s.current_policy_template_id))
                .map(|t| t.document.clone())
                .unwrap_or(Json::Null);
            Ok((boosted_id, boosted_doc, original_doc))
        })();
        async move {
            let result = match lookup {
                Ok((boosted_id, boosted_doc, original_doc)) => {
                    let key = session_key(&ps_id, &client_id);
                    let boost_rx = pcf::submit_delivery_boost(
                        &handle2,
                        key,
                        original_doc,
                        boosted_id,
                        boosted_doc,
                        Duration::from_secs(boost_seconds),
                    );
                    boost_rx.await.unwrap_or_else(|_| Err(AppError::Internal(anyhow::anyhow!("engine dropped reply"))))
                }
                Err(e) => Err(e),
            };
            let _ = reply_tx.send(result);
        }
    });
    reply_rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_manager::StubCertificateManager;
    use crate::config::Config;
    use crate::engine::Engine;
    use crate::m1::CreateSessionRequest;
    use crate::store::ProvisioningSessionType;
    use std::sync::Arc;

    async fn new_session(handle: &EngineHandle) -> String {
        handle
            .ask(|state| {
                let result = m1::create_session(
                    state,
                    CreateSessionRequest {
                        provisioning_session_type: ProvisioningSessionType::Downlink,
                        app_id: "app1".to_string(),
                        external_application_id: None,
                        asp_id: "asp1".to_string(),
                        boosted_policy_template_id: None,
                    },
                );
                async move { result.unwrap().0 }
            })
            .await
    }

    #[tokio::test]
    async fn sai_conditional_get_returns_not_modified_on_matching_etag() {
        let (engine, handle) = Engine::new(Config::default(), Arc::new(StubCertificateManager::default()));
        tokio::spawn(engine.run());
        let id = new_session(&handle).await;

        let etag = handle
            .ask({
                let id = id.clone();
                move |state| {
                    let doc = get_service_access_information(state, &id, None).unwrap();
                    async move {
                        match doc {
                            ConditionalGet::Ok(d) => d.etag,
                            ConditionalGet::NotModified => unreachable!(),
                        }
                    }
                }
            })
            .await;

        let outcome = handle
            .ask(move |state| {
                let result = get_service_access_information(state, &id, Some(&etag));
                async move { result }
            })
            .await;
        assert!(matches!(outcome, Ok(ConditionalGet::NotModified)));
    }

    #[tokio::test]
    async fn consumption_report_rejected_without_configured_reporting() {
        let (engine, handle) = Engine::new(Config::default(), Arc::new(StubCertificateManager::default()));
        tokio::spawn(engine.run());
        let id = new_session(&handle).await;

        let result = submit_consumption_report(&handle, id, serde_json::json!({})).await.unwrap();
        assert!(result.is_err());
    }
}
