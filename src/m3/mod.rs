//! M3 client engine: the AS reconciliation loop. Exactly one step — one
//! HTTP request — runs per AS-state node at a time; the node's `in_flight`
//! flag plus the single-engine-task ownership of [`EngineState`] together
//! provide that invariant without a lock.

use std::time::Duration;

use serde_json::Value as Json;

use crate::engine::{EngineHandle, EngineState};
use crate::store::{CertificateUpload, ChcUpload, PurgeRequest};

#[derive(Debug)]
enum Action {
    GetCertificates,
    GetContentHostingConfigurations,
    UploadCertificate { af_unique_id: String, pem: Vec<u8>, exists: bool },
    UploadChc { chc_id: String, document: Json, exists: bool },
    DeleteChc { chc_id: String },
    DeleteCertificate { af_unique_id: String },
    Purge { chc_id: String, filter_regex: Option<String> },
}

/// Choose the next action for `hostname` per the strict priority list
/// (certificates, CHCs, uploads before deletes, deletes before purges), or
/// `None` if the node is idle or already has a request in flight.
fn next_action(state: &EngineState, hostname: &str) -> Option<Action> {
    let node = state.store.as_node(hostname)?;
    if node.in_flight {
        return None;
    }
    if node.current_certificates.is_none() {
        return Some(Action::GetCertificates);
    }
    if node.current_content_hosting_configurations.is_none() {
        return Some(Action::GetContentHostingConfigurations);
    }
    if let Some(upload) = node.upload_certificates.front() {
        let exists = node
            .current_certificates
            .as_ref()
            .is_some_and(|list| list.contains(&upload.af_unique_id));
        return Some(Action::UploadCertificate {
            af_unique_id: upload.af_unique_id.clone(),
            pem: upload.pem.clone(),
            exists,
        });
    }
    if let Some(upload) = node.upload_content_hosting_configurations.front() {
        let exists = node
            .current_content_hosting_configurations
            .as_ref()
            .is_some_and(|list| list.contains(&upload.chc_id));
        return Some(Action::UploadChc {
            chc_id: upload.chc_id.clone(),
            document: upload.document.clone(),
            exists,
        });
    }
    if let Some(chc_id) = node.delete_content_hosting_configurations.front() {
        return Some(Action::DeleteChc { chc_id: chc_id.clone() });
    }
    if let Some(af_unique_id) = node.delete_certificates.front() {
        return Some(Action::DeleteCertificate { af_unique_id: af_unique_id.clone() });
    }
    if let Some(purge) = node.purge_content_hosting_cache.front() {
        return Some(Action::Purge {
            chc_id: purge.chc_id.clone(),
            filter_regex: purge.filter_regex.clone(),
        });
    }
    None
}

fn base_url(state: &EngineState, hostname: &str) -> Option<String> {
    let node = state.store.as_node(hostname)?;
    Some(format!("http://{}:{}/3gpp-m3/v1", node.config.canonical_hostname, node.config.m3_port))
}

/// Drive one reconciliation step for `hostname`, if one is available.
/// Non-blocking: the actual HTTP call runs on a spawned task so unrelated
/// AS nodes (and every other queued job) keep making progress while this
/// one is in flight; no ordering is promised across AS nodes.
pub fn kick(state: &mut EngineState, hostname: String) {
    let Some(action) = next_action(state, &hostname) else {
        return;
    };
    let Some(base) = base_url(state, &hostname) else {
        return;
    };
    if let Some(node) = state.store.as_node_mut(&hostname) {
        node.in_flight = true;
    }

    let client = state.http_client.clone();
    let handle = state.handle.clone();
    tokio::spawn(async move {
        let outcome = perform(&client, &base, &action).await;
        let hostname2 = hostname.clone();
        handle.submit(move |state| {
            apply_outcome(state, hostname2, action, outcome);
            std::future::ready(())
        });
    });
}

#[derive(Debug)]
enum Outcome {
    Success { body: Option<Json> },
    ClientError,
    ServerErrorOrTransport,
}

async fn perform(client: &reqwest::Client, base: &str, action: &Action) -> Outcome {
    let result = match action {
        Action::GetCertificates => client.get(format!("{base}/certificates")).send().await,
        Action::GetContentHostingConfigurations => {
            client.get(format!("{base}/content-hosting-configurations")).send().await
        }
        Action::UploadCertificate { af_unique_id, pem, exists } => {
            let url = format!("{base}/certificates/{af_unique_id}");
            let req = if *exists { client.put(&url) } else { client.post(&url) };
            req.header("content-type", "application/x-pem-file").body(pem.clone()).send().await
        }
        Action::UploadChc { chc_id, document, exists } => {
            let url = format!("{base}/content-hosting-configurations/{chc_id}");
            let req = if *exists { client.put(&url) } else { client.post(&url) };
            req.json(document).send().await
        }
        Action::DeleteChc { chc_id } => {
            client.delete(format!("{base}/content-hosting-configurations/{chc_id}")).send().await
        }
        Action::DeleteCertificate { af_unique_id } => {
            client.delete(format!("{base}/certificates/{af_unique_id}")).send().await
        }
        Action::Purge { chc_id, filter_regex } => {
            let url = format!("{base}/content-hosting-configurations/{chc_id}/purge");
            let mut req = client.post(url);
            if let Some(regex) = filter_regex {
                req = req
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(urlencoding::encode(regex).into_owned());
            }
            req.send().await
        }
    };

    match result {
        Ok(response) if response.status().is_success() => {
            let body = response.json::<Json>().await.ok();
            Outcome::Success { body }
        }
        Ok(response) if response.status().is_client_error() => Outcome::ClientError,
        Ok(_) => Outcome::ServerErrorOrTransport,
        Err(_) => Outcome::ServerErrorOrTransport,
    }
}

fn apply_outcome(state: &mut EngineState, hostname: String, action: Action, outcome: Outcome) {
    let Some(node) = state.store.as_node_mut(&hostname) else {
        return;
    };
    node.in_flight = false;

    match outcome {
        Outcome::Success { body } => {
            node.reset_backoff();
            match action {
                Action::GetCertificates => {
                    let ids = body
                        .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok())
                        .unwrap_or_default();
                    node.current_certificates = Some(ids);
                }
                Action::GetContentHostingConfigurations => {
                    let ids = body
                        .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok())
                        .unwrap_or_default();
                    node.current_content_hosting_configurations = Some(ids);
                }
                Action::UploadCertificate { af_unique_id, .. } => {
                    node.upload_certificates.pop_front();
                    if let Some(list) = node.current_certificates.as_mut() {
                        if !list.contains(&af_unique_id) {
                            list.push(af_unique_id);
                        }
                    }
                }
                Action::UploadChc { chc_id, .. } => {
                    node.upload_content_hosting_configurations.pop_front();
                    if let Some(list) = node.current_content_hosting_configurations.as_mut() {
                        if !list.contains(&chc_id) {
                            list.push(chc_id);
                        }
                    }
                }
                Action::DeleteChc { chc_id } => {
                    node.delete_content_hosting_configurations.pop_front();
                    if let Some(list) = node.current_content_hosting_configurations.as_mut() {
                        list.retain(|id| id != &chc_id);
                    }
                    let session_id = chc_id;
                    state.store.unassign_session_from_as_if_drained(&hostname, &session_id);
                    state.store.try_finalize_delete(&session_id);
                }
                Action::DeleteCertificate { af_unique_id } => {
                    node.delete_certificates.pop_front();
                    if let Some(list) = node.current_certificates.as_mut() {
                        list.retain(|id| id != &af_unique_id);
                    }
                    if let Some((session_id, _)) = af_unique_id.split_once(':') {
                        state.store.unassign_session_from_as_if_drained(&hostname, session_id);
                        state.store.try_finalize_delete(session_id);
                    }
                }
                Action::Purge { .. } => {
                    node.purge_content_hosting_cache.pop_front();
                }
            }
        }
        Outcome::ClientError => {
            tracing::warn!(hostname, ?action, "M3 request rejected by AS, dropping entry");
            node.reset_backoff();
            drop_head(node, &action);
        }
        Outcome::ServerErrorOrTransport => {
            tracing::warn!(hostname, ?action, backoff = ?node.backoff, "M3 request failed, retrying with backoff");
            node.bump_backoff();
            let delay = node.backoff;
            schedule_retry(&state.handle, hostname.clone(), delay);
            return;
        }
    }

    kick(state, hostname);
}

fn drop_head(node: &mut crate::store::AsStateNode, action: &Action) {
    match action {
        Action::UploadCertificate { .. } => {
            node.upload_certificates.pop_front();
        }
        Action::UploadChc { .. } => {
            node.upload_content_hosting_configurations.pop_front();
        }
        Action::DeleteChc { .. } => {
            node.delete_content_hosting_configurations.pop_front();
        }
        Action::DeleteCertificate { .. } => {
            node.delete_certificates.pop_front();
        }
        Action::Purge { .. } => {
            node.purge_content_hosting_cache.pop_front();
        }
        Action::GetCertificates | Action::GetContentHostingConfigurations => {}
    }
}

fn schedule_retry(handle: &EngineHandle, hostname: String, delay: Duration) {
    let handle2 = handle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        handle2.submit(move |state| {
            kick(state, hostname);
            std::future::ready(())
        });
    });
}

/// Enqueue a certificate upload on every AS assigned to `ps_id` and kick
/// reconciliation for each.
pub fn enqueue_certificate_upload(state: &mut EngineState, ps_id: &str, af_unique_id: &str, pem: Vec<u8>) {
    let hostnames = assigned_hostnames(state, ps_id);
    for hostname in hostnames {
        if let Some(node) = state.store.as_node_mut(&hostname) {
            node.assigned_sessions.insert(ps_id.to_string());
            node.upload_certificates.push_back(CertificateUpload {
                af_unique_id: af_unique_id.to_string(),
                pem: pem.clone(),
            });
        }
        kick(state, hostname);
    }
}

pub fn enqueue_certificate_delete(state: &mut EngineState, ps_id: &str, af_unique_id: &str) {
    let hostnames = assigned_hostnames(state, ps_id);
    for hostname in hostnames {
        if let Some(node) = state.store.as_node_mut(&hostname) {
            node.delete_certificates.push_back(af_unique_id.to_string());
        }
        kick(state, hostname);
    }
}

pub fn enqueue_chc_upload(state: &mut EngineState, ps_id: &str, document: Json) {
    let hostnames = assigned_hostnames(state, ps_id);
    for hostname in hostnames {
        if let Some(node) = state.store.as_node_mut(&hostname) {
            node.assigned_sessions.insert(ps_id.to_string());
            node.upload_content_hosting_configurations.push_back(ChcUpload {
                chc_id: ps_id.to_string(),
                document: document.clone(),
            });
        }
        kick(state, hostname);
    }
}

pub fn enqueue_purge(state: &mut EngineState, ps_id: &str, filter_regex: Option<String>) {
    let hostnames = assigned_hostnames(state, ps_id);
    for hostname in hostnames {
        if let Some(node) = state.store.as_node_mut(&hostname) {
            node.purge_content_hosting_cache.push_back(PurgeRequest {
                chc_id: ps_id.to_string(),
                filter_regex: filter_regex.clone(),
            });
        }
        kick(state, hostname);
    }
}

fn assigned_hostnames(state: &EngineState, ps_id: &str) -> Vec<String> {
    state
        .store
        .get_session(ps_id)
        .map(|s| s.assigned_application_servers.iter().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_manager::StubCertificateManager;
    use crate::config::{ApplicationServerConfig, Config};
    use crate::engine::Engine;
    use std::sync::Arc;

    fn config_with_as() -> Config {
        let mut config = Config::default();
        config.application_servers.push(ApplicationServerConfig {
            canonical_hostname: "as1.example.com".to_string(),
            url_path_prefix_format: "/{ps}/".to_string(),
            m3_port: 8443,
        });
        config
    }

    #[tokio::test]
    async fn unknown_current_lists_are_fetched_before_any_upload() {
        let (engine, handle) = Engine::new(config_with_as(), Arc::new(StubCertificateManager::default()));
        tokio::spawn(engine.run());

        let action_kind = handle
            .ask(|state| {
                let action = next_action(state, "as1.example.com");
                async move { format!("{action:?}") }
            })
            .await;
        assert!(action_kind.starts_with("Some(GetCertificates"));
    }

    #[tokio::test]
    async fn no_action_when_already_in_flight() {
        let (engine, handle) = Engine::new(config_with_as(), Arc::new(StubCertificateManager::default()));
        tokio::spawn(engine.run());

        let is_none = handle
            .ask(|state| {
                if let Some(node) = state.store.as_node_mut("as1.example.com") {
                    node.in_flight = true;
                    node.current_certificates = Some(vec![]);
                    node.current_content_hosting_configurations = Some(vec![]);
                }
                let action = next_action(state, "as1.example.com");
                async move { action.is_none() }
            })
            .await;
        assert!(is_none);
    }
}
