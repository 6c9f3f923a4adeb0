//! PCF/BSF client: BSF discovery cache, PCF AppSessionContext
//! establishment, and delivery-boost timers for the Network Assistance
//! feature.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value as Json};
use tokio::sync::oneshot;

use crate::engine::{EngineHandle, EngineState};
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone)]
struct BsfCacheEntry {
    /// `None` records a negative lookup (no PCF known for this UE address).
    pcf_endpoint: Option<String>,
    expires_at: DateTime<Utc>,
}

/// Caches BSF `Nbsf_Management` discovery results per UE address, with
/// separate positive/negative TTLs.
#[derive(Default)]
pub struct BsfCache {
    entries: BTreeMap<String, BsfCacheEntry>,
}

pub enum BsfLookup {
    Hit(Option<String>),
    Miss,
}

impl BsfCache {
    pub fn lookup(&self, ue_address: &str) -> BsfLookup {
        match self.entries.get(ue_address) {
            Some(entry) if entry.expires_at > Utc::now() => BsfLookup::Hit(entry.pcf_endpoint.clone()),
            _ => BsfLookup::Miss,
        }
    }

    pub fn insert(&mut self, ue_address: String, pcf_endpoint: Option<String>, ttl: Duration) {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(0));
        self.entries.insert(ue_address, BsfCacheEntry { pcf_endpoint, expires_at });
    }
}

/// An established PCF AppSessionContext backing one Network Assistance
/// session, plus the in-progress delivery boost, if any.
#[derive(Debug, Clone)]
pub struct PcfSessionRecord {
    pub app_session_context_url: String,
    pub current_policy_template_id: String,
    pub boost: Option<DeliveryBoost>,
}

#[derive(Debug, Clone)]
pub struct DeliveryBoost {
    pub original_policy_template_id: String,
    pub original_policy_template: Json,
}

#[derive(Default)]
pub struct PcfSessions {
    sessions: BTreeMap<String, PcfSessionRecord>,
}

impl PcfSessions {
    pub fn get(&self, key: &str) -> Option<&PcfSessionRecord> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut PcfSessionRecord> {
        self.sessions.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PcfSessionRecord> {
        self.sessions.remove(key)
    }
}

/// Resolve a PCF endpoint for `ue_address`, consulting the cache first and
/// falling back to a BSF `Nbsf_Management` discovery request. Runs off the
/// engine task; call sites submit a follow-up job with the result.
async fn discover_pcf(client: &reqwest::Client, bsf_endpoint: &str, ue_address: &str) -> AppResult<Option<String>> {
    let url = format!("{bsf_endpoint}/nbsf-management/v1/pcfBindings?ipv4Addr={ue_address}");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AppError::upstream("BSF", e.to_string()))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !response.status().is_success() {
        return Err(AppError::upstream("BSF", response.status().to_string()));
    }
    let body: Json = response
        .json()
        .await
        .map_err(|e| AppError::upstream("BSF", e.to_string()))?;
    let pcf_endpoint = body
        .get(0)
        .and_then(|binding| binding.get("pcfFqdn").or_else(|| binding.get("pcfIpEndPoint")))
        .and_then(Json::as_str)
        .map(str::to_string);
    Ok(pcf_endpoint)
}

async fn create_app_session_context(
    client: &reqwest::Client,
    pcf_endpoint: &str,
    ue_address: &str,
    policy_template: &Json,
) -> AppResult<String> {
    let url = format!("{pcf_endpoint}/npcf-policyauthorization/v1/app-sessions");
    let body = json!({
        "ueIpv4": ue_address,
        "policyTemplate": policy_template,
    });
    let response = client
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| AppError::upstream("PCF", e.to_string()))?;
    if !response.status().is_success() {
        return Err(AppError::upstream("PCF", response.status().to_string()));
    }
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| AppError::upstream("PCF", "missing Location header on app session context"))?;
    Ok(location)
}

async fn patch_app_session_context(client: &reqwest::Client, url: &str, policy_template: &Json) -> AppResult<()> {
    let body = json!({ "policyTemplate": policy_template });
    let response = client
        .patch(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| AppError::upstream("PCF", e.to_string()))?;
    if !response.status().is_success() {
        return Err(AppError::upstream("PCF", response.status().to_string()));
    }
    Ok(())
}

/// Establish (or reuse) a PCF session for `session_key`, applying
/// `policy_template`. Used by the Network Assistance entry point (M5, C7).
pub fn submit_establish_session(
    handle: &EngineHandle,
    session_key: String,
    ue_address: String,
    policy_template_id: String,
    policy_template: Json,
) -> oneshot::Receiver<AppResult<()>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let handle2 = handle.clone();
    handle.submit(move |state| {
        let already_established = state.pcf_sessions.get(&session_key).is_some();
        if already_established {
            let _ = reply_tx.send(Ok(()));
            return std::future::ready(());
        }

        let cached = state.bsf_cache.lookup(&ue_address);
        let client = state.http_client.clone();
        let bsf_endpoint = state.config.bsf.endpoint.clone();
        let pcf_endpoint_default = state.config.pcf.endpoint.clone();
        let positive_ttl = Duration::from_secs(state.config.bsf.cache_ttl_seconds);
        let negative_ttl = Duration::from_secs(state.config.bsf.negative_cache_ttl_seconds);

        tokio::spawn(async move {
            let pcf_endpoint = match cached {
                BsfLookup::Hit(endpoint) => endpoint,
                BsfLookup::Miss => match discover_pcf(&client, &bsf_endpoint, &ue_address).await {
                    Ok(endpoint) => Some(endpoint.unwrap_or(pcf_endpoint_default)),
                    Err(e) => {
                        let _ = reply_tx.send(Err(e));
                        return;
                    }
                },
            };
            let Some(pcf_endpoint) = pcf_endpoint else {
                let _ = reply_tx.send(Err(AppError::upstream("BSF", "no PCF registered for this UE address")));
                return;
            };

            let result = create_app_session_context(&client, &pcf_endpoint, &ue_address, &policy_template).await;
            handle2.submit(move |state| {
                match &result {
                    Ok(_) => state.bsf_cache.insert(ue_address.clone(), Some(pcf_endpoint.clone()), positive_ttl),
                    Err(_) => state.bsf_cache.insert(ue_address.clone(), None, negative_ttl),
                }
                match result {
                    Ok(app_session_context_url) => {
                        state.pcf_sessions.sessions.insert(
                            session_key,
                            PcfSessionRecord {
                                app_session_context_url,
                                current_policy_template_id: policy_template_id,
                                boost: None,
                            },
                        );
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

/// Start a delivery boost on `session_key`: PATCH the AppSessionContext to
/// `boosted_policy_template`, and schedule an automatic revert after
/// `duration`. A session already boosted rejects with a conflict,
/// synchronously, without contacting the PCF.
pub fn submit_delivery_boost(
    handle: &EngineHandle,
    session_key: String,
    original_policy_template: Json,
    boosted_policy_template_id: String,
    boosted_policy_template: Json,
    duration: Duration,
) -> oneshot::Receiver<AppResult<()>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let handle2 = handle.clone();
    handle.submit(move |state| {
        let Some(session) = state.pcf_sessions.get(&session_key) else {
            let _ = reply_tx.send(Err(AppError::not_found("pcf-session", &session_key)));
            return std::future::ready(());
        };
        if session.boost.is_some() {
            let _ = reply_tx.send(Err(AppError::Conflict("a delivery boost is already active for this session".to_string())));
            return std::future::ready(());
        }
        let url = session.app_session_context_url.clone();
        let original_policy_template_id = session.current_policy_template_id.clone();
        let client = state.http_client.clone();

        tokio::spawn(async move {
            let result = patch_app_session_context(&client, &url, &boosted_policy_template).await;
            let session_key2 = session_key.clone();
            handle2.submit(move |state| {
                match result {
                    Ok(()) => {
                        if let Some(session) = state.pcf_sessions.get_mut(&session_key2) {
                            session.current_policy_template_id = boosted_policy_template_id;
                            session.boost = Some(DeliveryBoost {
                                original_policy_template_id,
                                original_policy_template,
                            });
                        }
                        schedule_boost_expiry(&state.handle, session_key2.clone(), duration);
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

fn schedule_boost_expiry(handle: &EngineHandle, session_key: String, duration: Duration) {
    let handle2 = handle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        handle2.submit(move |state| {
            revert_boost(state, session_key);
            std::future::ready(())
        });
    });
}

/// Revert a session's AppSessionContext back to its pre-boost policy
/// template once the boost timer expires.
fn revert_boost(state: &mut EngineState, session_key: String) {
    let Some(session) = state.pcf_sessions.get(&session_key) else {
        return;
    };
    let Some(boost) = session.boost.clone() else {
        return;
    };
    let url = session.app_session_context_url.clone();
    let client = state.http_client.clone();
    let original = boost.original_policy_template_id.clone();
    let original_doc = boost.original_policy_template.clone();

    let handle2 = state.handle.clone();
    tokio::spawn(async move {
        let result = patch_app_session_context(&client, &url, &original_doc).await;
        handle2.submit(move |state| {
            if result.is_ok() {
                if let Some(session) = state.pcf_sessions.get_mut(&session_key) {
                    session.current_policy_template_id = original;
                    session.boost = None;
                }
            } else {
                tracing::warn!(session_key, "failed to revert delivery boost, will retry on next timer tick");
            }
            std::future::ready(())
        });
    });
}
