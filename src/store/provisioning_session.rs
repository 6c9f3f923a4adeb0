//! Entity types owned by the Provisioning Store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProvisioningSessionType {
    Downlink,
    Uplink,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CertificateState {
    Reserved,
    Uploaded,
    Synced,
}

#[derive(Debug, Clone)]
pub struct ServerCertificate {
    pub certificate_id: String,
    pub state: CertificateState,
    pub pem_path: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyTemplateState {
    Pending,
    Valid,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct PolicyTemplate {
    pub policy_template_id: String,
    pub state: PolicyTemplateState,
    pub document: Json,
}

#[derive(Debug, Clone)]
pub struct ConsumptionReportingConfig {
    pub document: Json,
}

#[derive(Debug, Clone)]
pub struct MetricsReportingConfig {
    pub metrics_reporting_configuration_id: String,
    pub document: Json,
}

/// The provider-supplied Content Hosting Configuration plus the M3
/// projection with certificate references rewritten to AF-unique ids.
#[derive(Debug, Clone)]
pub struct ContentHostingConfiguration {
    pub raw: Json,
    pub rewritten: Json,
    /// `certificateId`s this CHC referenced, extracted while rewriting, used
    /// to enforce the "every certificate reference resolves inside this PS"
    /// invariant on subsequent edits.
    pub referenced_certificate_ids: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct ProvisioningSession {
    pub id: String,
    pub session_type: ProvisioningSessionType,
    pub app_id: String,
    pub external_app_id: Option<String>,
    pub asp_id: String,
    pub content_hosting_configuration: Option<ContentHostingConfiguration>,
    pub certificates: BTreeMap<String, ServerCertificate>,
    pub policy_templates: BTreeMap<String, PolicyTemplate>,
    pub consumption_reporting: Option<ConsumptionReportingConfig>,
    pub metrics_reporting: BTreeMap<String, MetricsReportingConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Canonical hostnames of every AS this PS's resources are pushed to.
    pub assigned_application_servers: BTreeSet<String>,
    pub deleting: bool,
    /// Which of this PS's own policy templates Network Assistance switches
    /// to during a delivery boost.
    pub boosted_policy_template_id: Option<String>,
}

impl ProvisioningSession {
    pub fn new(
        id: String,
        session_type: ProvisioningSessionType,
        app_id: String,
        external_app_id: Option<String>,
        asp_id: String,
        assigned_application_servers: BTreeSet<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_type,
            app_id,
            external_app_id,
            asp_id,
            content_hosting_configuration: None,
            certificates: BTreeMap::new(),
            policy_templates: BTreeMap::new(),
            consumption_reporting: None,
            metrics_reporting: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            assigned_application_servers,
            deleting: false,
            boosted_policy_template_id: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Every certificate a CHC references must belong to this PS. Returns
    /// the unresolved reference ids, if any.
    pub fn unresolved_certificate_refs<'a>(
        &self,
        referenced: impl Iterator<Item = &'a str>,
    ) -> Vec<String> {
        referenced
            .filter(|id| !self.certificates.contains_key(*id))
            .map(str::to_string)
            .collect()
    }
}
