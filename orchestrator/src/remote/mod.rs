//! Remote execution channel
//!
//! One SSH transport, three modes: synchronous commands, acknowledged
//! detached launches and SFTP file transfer with ranged tail reads.

pub mod ack;
pub mod exec;
pub mod session;
pub mod sftp;
pub mod tail;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::OrchestratorError;
use exec::CommandOutput;

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// An authenticated session to a VM
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `script` under strict shell options; non-zero exit is an error
    async fn exec(&self, label: &str, script: &str) -> Result<CommandOutput, OrchestratorError>;

    /// Run a launch script that backgrounds its work, and wait for the
    /// acknowledgment token it prints once the process is running
    async fn exec_detached(
        &self,
        label: &str,
        launch: &str,
        ack_timeout: Duration,
    ) -> Result<(), OrchestratorError>;

    /// Copy a local file to `remote_path`; returns bytes written
    async fn upload_file(&self, local: &Path, remote_path: &str) -> Result<u64, OrchestratorError>;

    /// Write `contents` to `remote_path`
    async fn upload_bytes(&self, contents: &[u8], remote_path: &str) -> Result<(), OrchestratorError>;

    /// At most the last `max_bytes` of `remote_path`, plus whether the file
    /// was longer than that
    async fn read_tail(
        &self,
        remote_path: &str,
        max_bytes: u64,
    ) -> Result<(Vec<u8>, bool), OrchestratorError>;

    async fn close(&self);
}

/// Opens sessions; the seam tests replace
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        target: &SshTarget,
        private_key: &SecretString,
    ) -> Result<Box<dyn RemoteSession>, OrchestratorError>;
}
