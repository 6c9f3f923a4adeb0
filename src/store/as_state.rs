//! Application Server state node: the M3 reconciliation queues and
//! backoff state tracked per configured Application Server.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::ApplicationServerConfig;

#[derive(Debug, Clone)]
pub struct CertificateUpload {
    pub af_unique_id: String,
    pub pem: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ChcUpload {
    pub chc_id: String,
    pub document: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct PurgeRequest {
    pub chc_id: String,
    pub filter_regex: Option<String>,
}

/// Per-AS mirror of its current and desired state, plus the four work
/// queues and the purge queue.
pub struct AsStateNode {
    pub config: ApplicationServerConfig,
    pub assigned_sessions: std::collections::BTreeSet<String>,
    pub current_certificates: Option<Vec<String>>,
    pub current_content_hosting_configurations: Option<Vec<String>>,
    pub upload_certificates: VecDeque<CertificateUpload>,
    pub upload_content_hosting_configurations: VecDeque<ChcUpload>,
    pub delete_certificates: VecDeque<String>,
    pub delete_content_hosting_configurations: VecDeque<String>,
    pub purge_content_hosting_cache: VecDeque<PurgeRequest>,
    /// Exactly one outstanding M3 request at a time.
    pub in_flight: bool,
    pub backoff: Duration,
}

impl AsStateNode {
    pub fn new(config: ApplicationServerConfig) -> Self {
        Self {
            config,
            assigned_sessions: std::collections::BTreeSet::new(),
            current_certificates: None,
            current_content_hosting_configurations: None,
            upload_certificates: VecDeque::new(),
            upload_content_hosting_configurations: VecDeque::new(),
            delete_certificates: VecDeque::new(),
            delete_content_hosting_configurations: VecDeque::new(),
            purge_content_hosting_cache: VecDeque::new(),
            in_flight: false,
            backoff: Duration::from_secs(1),
        }
    }

    pub fn reset_backoff(&mut self) {
        self.backoff = Duration::from_secs(1);
    }

    pub fn bump_backoff(&mut self) {
        let doubled = self.backoff * 2;
        self.backoff = doubled.min(Duration::from_secs(60));
    }

    /// True once every queue referencing `session_id`'s work has drained,
    /// used by the two-phase PS deletion.
    pub fn has_pending_work(&self) -> bool {
        !self.upload_certificates.is_empty()
            || !self.upload_content_hosting_configurations.is_empty()
            || !self.delete_certificates.is_empty()
            || !self.delete_content_hosting_configurations.is_empty()
            || !self.purge_content_hosting_cache.is_empty()
            || self.in_flight
    }
}
