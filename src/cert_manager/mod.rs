//! Certificate manager glue: the external certmgr process contract.
//!
//! The external certmgr binary is the crate's one subprocess collaborator.
//! Everything above this module talks to it only through
//! [`CertificateManager`], so tests can swap in [`StubCertificateManager`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertVerb {
    NewCert,
    RenewCert,
    Revoke,
}

impl CertVerb {
    fn as_str(self) -> &'static str {
        match self {
            CertVerb::NewCert => "newcert",
            CertVerb::RenewCert => "renewcert",
            CertVerb::Revoke => "revoke",
        }
    }
}

#[async_trait]
pub trait CertificateManager: Send + Sync {
    /// Invoke certmgr for `verb` on `af_unique_id`. On success returns the
    /// PEM bytes captured from stdout (empty for `revoke`).
    async fn invoke(&self, verb: CertVerb, af_unique_id: &str) -> Result<Vec<u8>, AppError>;
}

/// Shells out to the configured certmgr executable using the
/// `certmgr <verb> <afUniqueId>` contract: exit 0 success, 1 CA error,
/// 2 naming error.
pub struct ProcessCertificateManager {
    executable: PathBuf,
    timeout: Duration,
}

impl ProcessCertificateManager {
    pub fn new(executable: PathBuf, timeout: Duration) -> Self {
        Self { executable, timeout }
    }
}

#[async_trait]
impl CertificateManager for ProcessCertificateManager {
    async fn invoke(&self, verb: CertVerb, af_unique_id: &str) -> Result<Vec<u8>, AppError> {
        let mut command = Command::new(&self.executable);
        command
            .arg(verb.as_str())
            .arg(af_unique_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| AppError::Timeout("certmgr".to_string()))?
            .map_err(|e| AppError::upstream("certmgr", e.to_string()))?;

        if !output.stderr.is_empty() {
            tracing::warn!(
                af_unique_id,
                verb = verb.as_str(),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "certmgr wrote to stderr"
            );
        }

        match output.status.code() {
            Some(0) => Ok(output.stdout),
            Some(1) => Err(AppError::upstream("certmgr", "CertificateAuthorityError")),
            Some(2) => Err(AppError::validation("invalid AF-unique certificate identifier")),
            _ => Err(AppError::upstream("certmgr", "CertificateAuthorityError")),
        }
    }
}

/// Deterministic filename for the PEM bytes of an AF-unique certificate id.
pub fn pem_path(store_dir: &Path, af_unique_id: &str) -> PathBuf {
    let safe_name = af_unique_id.replace(':', "_");
    store_dir.join(format!("{safe_name}.pem"))
}

pub async fn write_pem(path: &Path, pem: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
    file.write_all(pem).await.map_err(|e| AppError::Internal(e.into()))?;
    Ok(())
}

/// Test-only double: never shells out, returns canned PEM bytes and obeys
/// a configurable failure mode, letting FSM/M3 tests run deterministically.
#[cfg(any(test, feature = "test-support"))]
pub struct StubCertificateManager {
    pub canned_pem: Vec<u8>,
}

#[cfg(any(test, feature = "test-support"))]
impl Default for StubCertificateManager {
    fn default() -> Self {
        Self {
            canned_pem: b"-----BEGIN CERTIFICATE-----\nstub\n-----END CERTIFICATE-----\n".to_vec(),
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl CertificateManager for StubCertificateManager {
    async fn invoke(&self, verb: CertVerb, _af_unique_id: &str) -> Result<Vec<u8>, AppError> {
        match verb {
            CertVerb::Revoke => Ok(Vec::new()),
            CertVerb::NewCert | CertVerb::RenewCert => Ok(self.canned_pem.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_returns_canned_pem_for_newcert() {
        let stub = StubCertificateManager::default();
        let pem = stub.invoke(CertVerb::NewCert, "ps1:cert1").await.unwrap();
        assert!(pem.starts_with(b"-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn stub_revoke_returns_empty() {
        let stub = StubCertificateManager::default();
        let out = stub.invoke(CertVerb::Revoke, "ps1:cert1").await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn pem_path_replaces_colon_for_filesystem_safety() {
        let path = pem_path(Path::new("/data/certs"), "ps1:cert1");
        assert_eq!(path, Path::new("/data/certs/ps1_cert1.pem"));
    }
}
