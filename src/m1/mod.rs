//! M1 FSM: the provisioning API surface a content provider drives. Every
//! operation here runs synchronously inside
//! an engine job except certificate creation/deletion, which must suspend
//! on the external certmgr process and so is split into a continuation
//! (see [`submit_create_certificate`], [`submit_delete_certificate`]).

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{json, Value as Json};
use tokio::sync::oneshot;

use crate::cert_manager::{pem_path, write_pem, CertVerb};
use crate::engine::{EngineHandle, EngineState};
use crate::errors::{AppError, AppResult, InvalidParam};
use crate::store::{
    ConsumptionReportingConfig, ContentHostingConfiguration, MetricsReportingConfig,
    PolicyTemplate, PolicyTemplateState, ProvisioningSession, ProvisioningSessionType,
    ServerCertificate,
};
use crate::m3;
use crate::util::{af_unique_certificate_id, etag_for, etag_matches, new_id};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub provisioning_session_type: ProvisioningSessionType,
    pub app_id: String,
    #[serde(default)]
    pub external_application_id: Option<String>,
    pub asp_id: String,
    /// Identifies, among this PS's own policy templates, the one Network
    /// Assistance switches to during a delivery boost.
    #[serde(default)]
    pub boosted_policy_template_id: Option<String>,
}

pub fn session_to_json(session: &ProvisioningSession) -> Json {
    json!({
        "provisioningSessionId": session.id,
        "provisioningSessionType": session.session_type,
        "appId": session.app_id,
        "externalApplicationId": session.external_app_id,
        "aspId": session.asp_id,
        "boostedPolicyTemplateId": session.boosted_policy_template_id,
    })
}

/// Create a PS, assigning it to every configured Application Server (the
/// source names no per-PS AS selection mechanism, so every PS is pushed to
/// every configured AS; see DESIGN.md).
pub fn create_session(state: &mut EngineState, req: CreateSessionRequest) -> AppResult<(String, Json)> {
    let id = new_id();
    let hostnames: BTreeSet<String> = state.store.application_server_hostnames().into_iter().collect();
    let mut session = ProvisioningSession::new(
        id.clone(),
        req.provisioning_session_type,
        req.app_id,
        req.external_application_id,
        req.asp_id,
        hostnames,
    );
    session.boosted_policy_template_id = req.boosted_policy_template_id;
    state.store.insert_session(session);
    let session = state.store.get_session(&id)?;
    Ok((id, session_to_json(session)))
}

pub fn get_session(state: &EngineState, id: &str) -> AppResult<Json> {
    Ok(session_to_json(state.store.get_session(id)?))
}

/// Phase (i) of the two-phase delete: marks the session as deleting, then
/// kicks M3 reconciliation on every affected AS so the withdrawal actually
/// starts.
pub fn delete_session(state: &mut EngineState, id: &str) -> AppResult<()> {
    let hostnames: Vec<String> = {
        let session = state.store.get_session(id)?;
        session.assigned_application_servers.iter().cloned().collect()
    };
    state.store.begin_delete_session(id)?;
    for hostname in hostnames {
        m3::kick(state, hostname);
    }
    state.store.try_finalize_delete(id);
    Ok(())
}

fn check_if_match(if_match: Option<&str>, current_etag: &str) -> AppResult<()> {
    match if_match {
        None => Ok(()),
        Some(header) if etag_matches(header, current_etag) => Ok(()),
        Some(_) => Err(AppError::PreconditionFailed),
    }
}

fn current_chc_etag(session: &ProvisioningSession) -> String {
    let raw = session
        .content_hosting_configuration
        .as_ref()
        .map(|c| c.raw.clone())
        .unwrap_or(Json::Null);
    etag_for(&serde_json::to_vec(&raw).expect("CHC document is always serializable"))
}

/// Walk `value` collecting every string found under a `certificateId` key.
fn collect_certificate_ids(value: &Json, out: &mut BTreeSet<String>) {
    match value {
        Json::Object(map) => {
            for (key, v) in map {
                if key == "certificateId" {
                    if let Some(s) = v.as_str() {
                        out.insert(s.to_string());
                    }
                }
                collect_certificate_ids(v, out);
            }
        }
        Json::Array(items) => {
            for item in items {
                collect_certificate_ids(item, out);
            }
        }
        _ => {}
    }
}

/// Clone of `value` with every `certificateId` string rewritten to its
/// AF-unique form, for the projection actually shipped over M3.
fn rewrite_certificate_ids(value: &Json, ps_id: &str) -> Json {
    match value {
        Json::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, v) in map {
                if key == "certificateId" {
                    if let Some(s) = v.as_str() {
                        out.insert(key.clone(), Json::String(af_unique_certificate_id(ps_id, s)));
                        continue;
                    }
                }
                out.insert(key.clone(), rewrite_certificate_ids(v, ps_id));
            }
            Json::Object(out)
        }
        Json::Array(items) => Json::Array(items.iter().map(|i| rewrite_certificate_ids(i, ps_id)).collect()),
        other => other.clone(),
    }
}

/// Validate, rewrite, store and enqueue a new Content Hosting
/// Configuration.
pub fn put_content_hosting_configuration(
    state: &mut EngineState,
    id: &str,
    if_match: Option<&str>,
    raw: Json,
) -> AppResult<()> {
    let current_etag = current_chc_etag(state.store.get_session(id)?);
    check_if_match(if_match, &current_etag)?;

    let mut referenced = BTreeSet::new();
    collect_certificate_ids(&raw, &mut referenced);

    let session = state.store.get_session(id)?;
    let unresolved = session.unresolved_certificate_refs(referenced.iter().map(String::as_str));
    if !unresolved.is_empty() {
        let params = unresolved
            .into_iter()
            .map(|id| InvalidParam::with_reason("certificateId", format!("unknown certificate id {id}")))
            .collect();
        return Err(AppError::validation_with_params("CHC references an unknown certificate", params));
    }

    let rewritten = rewrite_certificate_ids(&raw, id);
    let identical = state
        .store
        .get_session(id)?
        .content_hosting_configuration
        .as_ref()
        .is_some_and(|existing| existing.raw == raw);

    let session = state.store.get_session_mut(id)?;
    session.content_hosting_configuration = Some(ContentHostingConfiguration {
        raw,
        rewritten: rewritten.clone(),
        referenced_certificate_ids: referenced,
    });
    session.touch();
    state.store.invalidate_sai(id);

    // Idempotent re-PUT of an identical CHC enqueues no new M3 work.
    if !identical {
        m3::enqueue_chc_upload(state, id, rewritten);
    }
    Ok(())
}

pub fn get_content_hosting_configuration(state: &EngineState, id: &str) -> AppResult<Json> {
    let session = state.store.get_session(id)?;
    session
        .content_hosting_configuration
        .as_ref()
        .map(|c| c.raw.clone())
        .ok_or_else(|| AppError::not_found("content-hosting-configuration", id))
}

/// Reserve a certificate id and kick off certmgr asynchronously. The
/// engine-facing half of certificate creation; the actual subprocess call
/// happens off the engine task.
pub fn submit_create_certificate(
    handle: &EngineHandle,
    ps_id: String,
) -> oneshot::Receiver<AppResult<(String, String)>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let handle2 = handle.clone();
    handle.submit(move |state| {
        let result = (|| -> AppResult<String> {
            let cert_id = new_id();
            let session = state.store.get_session_mut(&ps_id)?;
            session.certificates.insert(
                cert_id.clone(),
                ServerCertificate {
                    certificate_id: cert_id.clone(),
                    state: crate::store::CertificateState::Reserved,
                    pem_path: None,
                },
            );
            Ok(cert_id)
        })();
        let cert_id = match result {
            Ok(id) => id,
            Err(e) => {
                let _ = reply_tx.send(Err(e));
                return std::future::ready(());
            }
        };

        let cert_manager = state.cert_manager.clone();
        let store_dir = state.config.certificate_store_dir.clone();
        let af_unique_id = af_unique_certificate_id(&ps_id, &cert_id);

        tokio::spawn(async move {
            let result = cert_manager.invoke(CertVerb::NewCert, &af_unique_id).await;
            let result = match result {
                Ok(pem) => {
                    let path = pem_path(&store_dir, &af_unique_id);
                    write_pem(&path, &pem).await.map(|()| (pem, path))
                }
                Err(e) => Err(e),
            };
            handle2.submit(move |state| {
                finish_create_certificate(state, ps_id, cert_id, result, reply_tx);
                std::future::ready(())
            });
        });
        std::future::ready(())
    });
    reply_rx
}

fn finish_create_certificate(
    state: &mut EngineState,
    ps_id: String,
    cert_id: String,
    result: AppResult<(Vec<u8>, std::path::PathBuf)>,
    reply_tx: oneshot::Sender<AppResult<(String, String)>>,
) {
    let af_unique_id = af_unique_certificate_id(&ps_id, &cert_id);
    match result {
        Ok((pem, path)) => {
            if let Ok(session) = state.store.get_session_mut(&ps_id) {
                if let Some(cert) = session.certificates.get_mut(&cert_id) {
                    cert.state = crate::store::CertificateState::Uploaded;
                    cert.pem_path = Some(path);
                }
                session.touch();
            }
            state.store.invalidate_sai(&ps_id);
            m3::enqueue_certificate_upload(state, &ps_id, &af_unique_id, pem);
            let _ = reply_tx.send(Ok((cert_id, af_unique_id)));
        }
        Err(e) => {
            if let Ok(session) = state.store.get_session_mut(&ps_id) {
                session.certificates.remove(&cert_id);
            }
            let _ = reply_tx.send(Err(e));
        }
    }
}

pub fn get_certificate_pem(state: &EngineState, ps_id: &str, cert_id: &str) -> AppResult<Vec<u8>> {
    let session = state.store.get_session(ps_id)?;
    let cert = session
        .certificates
        .get(cert_id)
        .ok_or_else(|| AppError::not_found("certificate", cert_id))?;
    let path = cert
        .pem_path
        .as_ref()
        .ok_or_else(|| AppError::not_found("certificate", cert_id))?;
    std::fs::read(path).map_err(|e| AppError::Internal(e.into()))
}

/// Revoke via certmgr, then remove the file and enqueue an AS-side delete.
pub fn submit_delete_certificate(handle: &EngineHandle, ps_id: String, cert_id: String) -> oneshot::Receiver<AppResult<()>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let handle2 = handle.clone();
    handle.submit(move |state| {
        let af_unique_id = af_unique_certificate_id(&ps_id, &cert_id);
        let exists = state
            .store
            .get_session(&ps_id)
            .map(|s| s.certificates.contains_key(&cert_id))
            .unwrap_or(false);
        if !exists {
            let _ = reply_tx.send(Err(AppError::not_found("certificate", &cert_id)));
            return std::future::ready(());
        }

        let cert_manager = state.cert_manager.clone();
        let store_dir = state.config.certificate_store_dir.clone();
        tokio::spawn(async move {
            let result = cert_manager.invoke(CertVerb::Revoke, &af_unique_id).await;
            let path = pem_path(&store_dir, &af_unique_id);
            let _ = tokio::fs::remove_file(&path).await;
            handle2.submit(move |state| {
                match result {
                    Ok(_) => {
                        if let Ok(session) = state.store.get_session_mut(&ps_id) {
                            session.certificates.remove(&cert_id);
                            session.touch();
                        }
                        state.store.invalidate_sai(&ps_id);
                        m3::enqueue_certificate_delete(state, &ps_id, &af_unique_id);
                        let _ = reply_tx.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply_tx.send(Err(e));
                    }
                }
                std::future::ready(())
            });
        });
        std::future::ready(())
    });
    reply_rx
}

pub fn create_policy_template(state: &mut EngineState, ps_id: &str, document: Json) -> AppResult<Json> {
    let id = new_id();
    let session = state.store.get_session_mut(ps_id)?;
    let template = PolicyTemplate {
        policy_template_id: id.clone(),
        state: PolicyTemplateState::Pending,
        document,
    };
    session.policy_templates.insert(id.clone(), template.clone());
    session.touch();
    state.store.invalidate_sai(ps_id);
    Ok(policy_template_json(&template))
}

fn policy_template_json(template: &PolicyTemplate) -> Json {
    json!({
        "policyTemplateId": template.policy_template_id,
        "state": match template.state {
            PolicyTemplateState::Pending => "pending",
            PolicyTemplateState::Valid => "valid",
            PolicyTemplateState::Invalid => "invalid",
        },
        "document": template.document,
    })
}

pub fn get_policy_template(state: &EngineState, ps_id: &str, pt_id: &str) -> AppResult<Json> {
    let session = state.store.get_session(ps_id)?;
    session
        .policy_templates
        .get(pt_id)
        .map(policy_template_json)
        .ok_or_else(|| AppError::not_found("policy-template", pt_id))
}

/// Management-driven transition (`valid`/`invalid`); SAI visibility follows
/// `state`.
pub fn set_policy_template_state(
    state: &mut EngineState,
    ps_id: &str,
    pt_id: &str,
    new_state: PolicyTemplateState,
) -> AppResult<Json> {
    let session = state.store.get_session_mut(ps_id)?;
    let template = session
        .policy_templates
        .get_mut(pt_id)
        .ok_or_else(|| AppError::not_found("policy-template", pt_id))?;
    template.state = new_state;
    let rendered = policy_template_json(template);
    session.touch();
    state.store.invalidate_sai(ps_id);
    Ok(rendered)
}

/// Replace a policy template's document, used by M5 dynamic-policy updates;
/// resets state to `pending` pending re-approval.
pub fn update_policy_template_document(state: &mut EngineState, ps_id: &str, pt_id: &str, document: Json) -> AppResult<Json> {
    let session = state.store.get_session_mut(ps_id)?;
    let template = session
        .policy_templates
        .get_mut(pt_id)
        .ok_or_else(|| AppError::not_found("policy-template", pt_id))?;
    template.document = document;
    template.state = PolicyTemplateState::Pending;
    let rendered = policy_template_json(template);
    session.touch();
    state.store.invalidate_sai(ps_id);
    Ok(rendered)
}

pub fn delete_policy_template(state: &mut EngineState, ps_id: &str, pt_id: &str) -> AppResult<()> {
    let session = state.store.get_session_mut(ps_id)?;
    session
        .policy_templates
        .remove(pt_id)
        .ok_or_else(|| AppError::not_found("policy-template", pt_id))?;
    session.touch();
    state.store.invalidate_sai(ps_id);
    Ok(())
}

pub fn put_consumption_reporting_configuration(state: &mut EngineState, ps_id: &str, document: Json) -> AppResult<()> {
    let session = state.store.get_session_mut(ps_id)?;
    session.consumption_reporting = Some(ConsumptionReportingConfig { document });
    session.touch();
    state.store.invalidate_sai(ps_id);
    Ok(())
}

pub fn get_consumption_reporting_configuration(state: &EngineState, ps_id: &str) -> AppResult<Json> {
    let session = state.store.get_session(ps_id)?;
    session
        .consumption_reporting
        .as_ref()
        .map(|c| c.document.clone())
        .ok_or_else(|| AppError::not_found("consumption-reporting-configuration", ps_id))
}

pub fn delete_consumption_reporting_configuration(state: &mut EngineState, ps_id: &str) -> AppResult<()> {
    let session = state.store.get_session_mut(ps_id)?;
    session.consumption_reporting = None;
    session.touch();
    state.store.invalidate_sai(ps_id);
    Ok(())
}

pub fn create_metrics_reporting_configuration(state: &mut EngineState, ps_id: &str, document: Json) -> AppResult<Json> {
    let id = new_id();
    let session = state.store.get_session_mut(ps_id)?;
    let config = MetricsReportingConfig { metrics_reporting_configuration_id: id.clone(), document };
    session.metrics_reporting.insert(id, config.clone());
    session.touch();
    Ok(metrics_config_json(&config))
}

fn metrics_config_json(config: &MetricsReportingConfig) -> Json {
    json!({
        "metricsReportingConfigurationId": config.metrics_reporting_configuration_id,
        "document": config.document,
    })
}

pub fn get_metrics_reporting_configuration(state: &EngineState, ps_id: &str, mid: &str) -> AppResult<Json> {
    let session = state.store.get_session(ps_id)?;
    session
        .metrics_reporting
        .get(mid)
        .map(metrics_config_json)
        .ok_or_else(|| AppError::not_found("metrics-reporting-configuration", mid))
}

pub fn delete_metrics_reporting_configuration(state: &mut EngineState, ps_id: &str, mid: &str) -> AppResult<()> {
    let session = state.store.get_session_mut(ps_id)?;
    session
        .metrics_reporting
        .remove(mid)
        .ok_or_else(|| AppError::not_found("metrics-reporting-configuration", mid))?;
    session.touch();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_manager::StubCertificateManager;
    use crate::config::Config;
    use crate::engine::Engine;
    use std::sync::Arc;

    fn new_engine() -> (EngineHandle, tokio::task::JoinHandle<()>) {
        let (engine, handle) = Engine::new(Config::default(), Arc::new(StubCertificateManager::default()));
        let join = tokio::spawn(engine.run());
        (handle, join)
    }

    #[tokio::test]
    async fn create_then_get_returns_minted_id() {
        let (handle, _join) = new_engine();
        let (id, _body) = handle
            .ask(|state| {
                let result = create_session(
                    state,
                    CreateSessionRequest {
                        provisioning_session_type: ProvisioningSessionType::Downlink,
                        app_id: "app1".to_string(),
                        external_application_id: None,
                        asp_id: "asp1".to_string(),
                        boosted_policy_template_id: None,
                    },
                );
                async move { result.unwrap() }
            })
            .await;

        let fetched = handle.ask(move |state| {
            let result = get_session(state, &id);
            async move { result }
        }).await;
        assert!(fetched.is_ok());
    }

    #[tokio::test]
    async fn chc_with_unknown_certificate_ref_is_rejected() {
        let (handle, _join) = new_engine();
        let (id, _) = handle
            .ask(|state| {
                let result = create_session(
                    state,
                    CreateSessionRequest {
                        provisioning_session_type: ProvisioningSessionType::Downlink,
                        app_id: "app1".to_string(),
                        external_application_id: None,
                        asp_id: "asp1".to_string(),
                        boosted_policy_template_id: None,
                    },
                );
                async move { result.unwrap() }
            })
            .await;

        let doc = json!({ "distributionConfigurations": [{ "certificateId": "missing" }] });
        let outcome = handle
            .ask(move |state| {
                let result = put_content_hosting_configuration(state, &id, None, doc);
                async move { result }
            })
            .await;
        assert!(matches!(outcome, Err(AppError::Validation { .. })));
    }

    #[tokio::test]
    async fn idempotent_re_put_of_identical_chc_enqueues_no_new_work() {
        let (handle, _join) = new_engine();
        let (id, _) = handle
            .ask(|state| {
                let result = create_session(
                    state,
                    CreateSessionRequest {
                        provisioning_session_type: ProvisioningSessionType::Downlink,
                        app_id: "app1".to_string(),
                        external_application_id: None,
                        asp_id: "asp1".to_string(),
                        boosted_policy_template_id: None,
                    },
                );
                async move { result.unwrap() }
            })
            .await;

        let doc = json!({ "distributionConfigurations": [] });
        let id2 = id.clone();
        handle
            .ask(move |state| {
                let result = put_content_hosting_configuration(state, &id2, None, doc.clone());
                async move { result.unwrap() }
            })
            .await;

        let queue_len_after_first = handle
            .ask({
                let id = id.clone();
                move |state| {
                    let len = state
                        .store
                        .application_server_hostnames()
                        .iter()
                        .filter_map(|h| state.store.as_node(h))
                        .map(|n| n.upload_content_hosting_configurations.len())
                        .sum::<usize>();
                    let _ = &id;
                    async move { len }
                }
            })
            .await;

        let doc2 = json!({ "distributionConfigurations": [] });
        handle
            .ask(move |state| {
                let result = put_content_hosting_configuration(state, &id, None, doc2);
                async move { result.unwrap() }
            })
            .await;

        let queue_len_after_second = handle
            .ask(move |state| {
                let len = state
                    .store
                    .application_server_hostnames()
                    .iter()
                    .filter_map(|h| state.store.as_node(h))
                    .map(|n| n.upload_content_hosting_configurations.len())
                    .sum::<usize>();
                async move { len }
            })
            .await;

        assert_eq!(queue_len_after_first, queue_len_after_second);
    }
}
