//! The Provisioning Store: authoritative in-memory entities for every
//! provisioning session, AS-state node, and SAI cache.

pub mod as_state;
pub mod provisioning_session;
pub mod sai;

use std::collections::BTreeMap;

use crate::config::Config;
use crate::errors::AppError;

pub use as_state::{AsStateNode, CertificateUpload, ChcUpload, PurgeRequest};
pub use provisioning_session::{
    CertificateState, ConsumptionReportingConfig, ContentHostingConfiguration,
    MetricsReportingConfig, PolicyTemplate, PolicyTemplateState, ProvisioningSession,
    ProvisioningSessionType, ServerCertificate,
};
pub use sai::{SaiCache, SaiDocument};

/// Authoritative in-memory entities and their indices. Owned exclusively
/// by the engine actor — no locking.
pub struct ProvisioningStore {
    sessions: BTreeMap<String, ProvisioningSession>,
    sai_caches: BTreeMap<String, SaiCache>,
    application_servers: BTreeMap<String, AsStateNode>,
}

impl ProvisioningStore {
    pub fn new(config: &Config) -> Self {
        let mut application_servers = BTreeMap::new();
        for as_config in &config.application_servers {
            application_servers.insert(
                as_config.canonical_hostname.clone(),
                AsStateNode::new(as_config.clone()),
            );
        }
        Self {
            sessions: BTreeMap::new(),
            sai_caches: BTreeMap::new(),
            application_servers,
        }
    }

    pub fn application_server_hostnames(&self) -> Vec<String> {
        self.application_servers.keys().cloned().collect()
    }

    pub fn as_node(&self, hostname: &str) -> Option<&AsStateNode> {
        self.application_servers.get(hostname)
    }

    pub fn as_node_mut(&mut self, hostname: &str) -> Option<&mut AsStateNode> {
        self.application_servers.get_mut(hostname)
    }

    pub fn as_nodes_mut(&mut self) -> impl Iterator<Item = (&String, &mut AsStateNode)> {
        self.application_servers.iter_mut()
    }

    pub fn insert_session(&mut self, session: ProvisioningSession) {
        self.sai_caches.insert(session.id.clone(), SaiCache::default());
        self.sessions.insert(session.id.clone(), session);
    }

    /// Reads during deletion return 404 to both M1 and M5.
    pub fn get_session(&self, id: &str) -> Result<&ProvisioningSession, AppError> {
        match self.sessions.get(id) {
            Some(s) if !s.deleting => Ok(s),
            _ => Err(AppError::not_found("provisioning-session", id)),
        }
    }

    pub fn get_session_mut(&mut self, id: &str) -> Result<&mut ProvisioningSession, AppError> {
        match self.sessions.get_mut(id) {
            Some(s) if !s.deleting => Ok(s),
            _ => Err(AppError::not_found("provisioning-session", id)),
        }
    }

    pub fn list_session_ids(&self) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| !s.deleting)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Every mutation invalidates the PS's SAI cache.
    pub fn invalidate_sai(&mut self, id: &str) {
        if let Some(cache) = self.sai_caches.get_mut(id) {
            cache.invalidate();
        }
    }

    pub fn sai_for(&mut self, id: &str) -> Result<SaiDocument, AppError> {
        let session = self
            .sessions
            .get(id)
            .filter(|s| !s.deleting)
            .ok_or_else(|| AppError::not_found("provisioning-session", id))?;
        let cache = self
            .sai_caches
            .get_mut(id)
            .expect("every session has a SAI cache slot");
        Ok(cache.get_or_build(session))
    }

    /// Phase (i) of the two-phase delete: mark deleting and enqueue AS-side
    /// removal of every id this PS contributed, on every AS it was assigned to.
    pub fn begin_delete_session(&mut self, id: &str) -> Result<(), AppError> {
        let session = self.get_session_mut(id)?;
        session.deleting = true;
        let hostnames: Vec<_> = session.assigned_application_servers.iter().cloned().collect();
        let cert_af_ids: Vec<_> = session
            .certificates
            .keys()
            .map(|cert_id| crate::util::af_unique_certificate_id(id, cert_id))
            .collect();
        let has_chc = session.content_hosting_configuration.is_some();
        for hostname in hostnames {
            if let Some(node) = self.as_node_mut(&hostname) {
                for af_id in &cert_af_ids {
                    node.delete_certificates.push_back(af_id.clone());
                }
                if has_chc {
                    node.delete_content_hosting_configurations.push_back(id.to_string());
                }
            }
        }
        Ok(())
    }

    /// Phase (ii): once every AS node that referenced this PS has drained
    /// its queues for it, the record can be freed. The engine calls this
    /// after each successful M3 step.
    pub fn try_finalize_delete(&mut self, id: &str) -> bool {
        let still_pending = self
            .application_servers
            .values()
            .any(|node| node.assigned_sessions.contains(id));
        if still_pending {
            return false;
        }
        let Some(session) = self.sessions.get(id) else {
            return false;
        };
        if !session.deleting {
            return false;
        }
        self.sessions.remove(id);
        self.sai_caches.remove(id);
        true
    }

    /// Drop the AS's membership record for `session_id` once none of its
    /// queues still mention that session, completing phase (i) of the
    /// delete for this particular AS node.
    pub fn unassign_session_from_as_if_drained(&mut self, as_hostname: &str, session_id: &str) {
        if let Some(node) = self.as_node_mut(as_hostname) {
            let prefix = format!("{session_id}:");
            let still_queued = node.delete_certificates.iter().any(|id| id.starts_with(&prefix))
                || node.upload_certificates.iter().any(|c| c.af_unique_id.starts_with(&prefix))
                || node.delete_content_hosting_configurations.iter().any(|id| id == session_id)
                || node.upload_content_hosting_configurations.iter().any(|c| c.chc_id == *session_id);
            if !still_queued {
                node.assigned_sessions.remove(session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn store() -> ProvisioningStore {
        ProvisioningStore::new(&Config::default())
    }

    fn new_session(id: &str) -> ProvisioningSession {
        ProvisioningSession::new(
            id.to_string(),
            ProvisioningSessionType::Downlink,
            "app1".to_string(),
            None,
            "asp1".to_string(),
            BTreeSet::new(),
        )
    }

    #[test]
    fn get_session_returns_not_found_for_unknown_id() {
        let store = store();
        assert!(store.get_session("missing").is_err());
    }

    #[test]
    fn deleting_session_is_invisible_to_reads() {
        let mut store = store();
        store.insert_session(new_session("ps1"));
        store.begin_delete_session("ps1").unwrap();
        assert!(store.get_session("ps1").is_err());
        assert!(!store.list_session_ids().contains(&"ps1".to_string()));
    }

    #[test]
    fn finalize_delete_removes_record_once_unreferenced() {
        let mut store = store();
        store.insert_session(new_session("ps1"));
        store.begin_delete_session("ps1").unwrap();
        assert!(store.try_finalize_delete("ps1"));
        assert!(store.sai_for("ps1").is_err());
    }
}
