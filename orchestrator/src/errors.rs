//! Error types for the optimization orchestrator

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("SSH error: {0}")]
    SshError(#[from] russh::Error),

    #[error("SFTP error: {0}")]
    SftpError(#[from] russh_sftp::client::error::Error),

    /// Cloud control-plane answered with a non-success status.
    #[error("Provisioning error: {status} - {body}")]
    Provisioning { status: u16, body: String },

    /// SSH handshake or authentication failed.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A synchronous remote command exited non-zero.
    #[error("Remote command failed: {message}")]
    RemoteCommand {
        message: String,
        stdout: String,
        stderr: String,
    },

    /// A detached remote launch never printed its acknowledgment token.
    #[error("Remote launch was not acknowledged within {timeout_secs}s")]
    AckTimeout {
        timeout_secs: u64,
        stdout: String,
        stderr: String,
    },

    /// Missing local engine sources or market-data snapshot.
    #[error("Local I/O error: {0}")]
    LocalIo(String),

    #[error("Key material error: {0}")]
    Key(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Whether a polling loop may try the same call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Connectivity(_)
                | OrchestratorError::SshError(_)
                | OrchestratorError::IoError(_)
                | OrchestratorError::Timeout(_)
        )
    }

    /// Diagnostic output captured from the remote side, if any.
    pub fn remote_output(&self) -> Option<(&str, &str)> {
        match self {
            OrchestratorError::RemoteCommand { stdout, stderr, .. }
            | OrchestratorError::AckTimeout { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }
}
