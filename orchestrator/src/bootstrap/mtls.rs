//! Mutual-TLS client bundle for the remote process
//!
//! When the platform API only accepts client certificates, the VM gets a
//! copy of the local bundle so the engine can report back.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::errors::OrchestratorError;
use crate::remote::exec::sh_quote;
use crate::remote::RemoteSession;
use crate::storage::settings::MtlsSettings;

const CERT_NAME: &str = "client.crt";
const KEY_NAME: &str = "client.key";
const CA_NAME: &str = "ca.crt";

/// PEM contents read and checked locally
#[derive(Clone)]
pub struct MtlsBundle {
    cert: Vec<u8>,
    key: Vec<u8>,
    ca: Vec<u8>,
}

impl std::fmt::Debug for MtlsBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtlsBundle")
            .field("cert_bytes", &self.cert.len())
            .field("key", &"[REDACTED]")
            .field("ca_bytes", &self.ca.len())
            .finish()
    }
}

/// Where the bundle lives on the VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMtlsPaths {
    pub cert: String,
    pub key: String,
    pub ca: String,
}

impl RemoteMtlsPaths {
    pub fn under(dir: &str) -> Self {
        let dir = dir.trim_end_matches('/');
        Self {
            cert: format!("{}/{}", dir, CERT_NAME),
            key: format!("{}/{}", dir, KEY_NAME),
            ca: format!("{}/{}", dir, CA_NAME),
        }
    }
}

impl MtlsBundle {
    /// Read the configured bundle; `None` when mTLS is disabled
    pub async fn load(settings: &MtlsSettings) -> Result<Option<Self>, OrchestratorError> {
        if !settings.enabled {
            return Ok(None);
        }
        let cert = read_pem(settings.cert_path.as_deref(), "client certificate").await?;
        let key = read_pem(settings.key_path.as_deref(), "client key").await?;
        let ca = read_pem(settings.ca_path.as_deref(), "CA certificate").await?;

        Self::from_pem(&cert, &key, &ca).map(Some)
    }

    pub fn from_pem(cert: &[u8], key: &[u8], ca: &[u8]) -> Result<Self, OrchestratorError> {
        let bundle = Self {
            cert: cert.to_vec(),
            key: key.to_vec(),
            ca: ca.to_vec(),
        };
        bundle.validate()?;
        Ok(bundle)
    }

    fn validate(&self) -> Result<(), OrchestratorError> {
        let certs = count_certs(&self.cert, "client certificate")?;
        if certs == 0 {
            return Err(OrchestratorError::Config(
                "client certificate file holds no certificates".to_string(),
            ));
        }
        if count_certs(&self.ca, "CA certificate")? == 0 {
            return Err(OrchestratorError::Config(
                "CA file holds no certificates".to_string(),
            ));
        }
        let key = rustls_pemfile::private_key(&mut &self.key[..])
            .map_err(|e| OrchestratorError::Config(format!("client key is not valid PEM: {}", e)))?;
        if key.is_none() {
            return Err(OrchestratorError::Config(
                "client key file holds no private key".to_string(),
            ));
        }
        Ok(())
    }

    /// Upload into `remote_dir`, key readable by root only
    pub async fn upload(
        &self,
        session: &dyn RemoteSession,
        remote_dir: &str,
    ) -> Result<RemoteMtlsPaths, OrchestratorError> {
        let paths = RemoteMtlsPaths::under(remote_dir);
        session
            .exec(
                "prepare mTLS directory",
                &format!("mkdir -p {0}\nchmod 700 {0}", sh_quote(remote_dir)),
            )
            .await?;
        session.upload_bytes(&self.cert, &paths.cert).await?;
        session.upload_bytes(&self.key, &paths.key).await?;
        session.upload_bytes(&self.ca, &paths.ca).await?;
        session
            .exec(
                "restrict mTLS key",
                &format!(
                    "chmod 600 {}\nchmod 644 {} {}",
                    sh_quote(&paths.key),
                    sh_quote(&paths.cert),
                    sh_quote(&paths.ca)
                ),
            )
            .await?;
        info!("Uploaded mTLS bundle to {}", remote_dir);
        Ok(paths)
    }
}

async fn read_pem(path: Option<&Path>, what: &str) -> Result<Vec<u8>, OrchestratorError> {
    let path: PathBuf = path
        .map(Path::to_path_buf)
        .ok_or_else(|| OrchestratorError::Config(format!("mTLS is enabled but no {} path is set", what)))?;
    tokio::fs::read(&path).await.map_err(|e| {
        OrchestratorError::LocalIo(format!("cannot read {} {}: {}", what, path.display(), e))
    })
}

fn count_certs(pem: &[u8], what: &str) -> Result<usize, OrchestratorError> {
    let mut count = 0;
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        cert.map_err(|e| OrchestratorError::Config(format!("{} is not valid PEM: {}", what, e)))?;
        count += 1;
    }
    Ok(count)
}
