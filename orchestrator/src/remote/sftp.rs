//! SFTP transfers over an established session

use std::path::Path;

use russh::client::Handle;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::errors::OrchestratorError;
use crate::remote::session::ClientHandler;
use crate::remote::tail::read_tail_from;

pub(crate) async fn open(handle: &Handle<ClientHandler>) -> Result<SftpSession, OrchestratorError> {
    let channel = handle.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    Ok(SftpSession::new(channel.into_stream()).await?)
}

pub(crate) async fn upload_file(
    sftp: &SftpSession,
    local: &Path,
    remote_path: &str,
) -> Result<u64, OrchestratorError> {
    let mut source = tokio::fs::File::open(local).await.map_err(|e| {
        OrchestratorError::LocalIo(format!("cannot open {}: {}", local.display(), e))
    })?;
    let mut target = sftp.create(remote_path).await?;
    let written = tokio::io::copy(&mut source, &mut target).await?;
    target.flush().await?;
    target.shutdown().await?;
    debug!("Uploaded {} ({} bytes) to {}", local.display(), written, remote_path);
    Ok(written)
}

pub(crate) async fn upload_bytes(
    sftp: &SftpSession,
    contents: &[u8],
    remote_path: &str,
) -> Result<(), OrchestratorError> {
    let mut target = sftp.create(remote_path).await?;
    target.write_all(contents).await?;
    target.flush().await?;
    target.shutdown().await?;
    debug!("Wrote {} bytes to {}", contents.len(), remote_path);
    Ok(())
}

/// `stat` the file, then read only from `max(0, size - max_bytes)` onwards
pub(crate) async fn read_tail(
    sftp: &SftpSession,
    remote_path: &str,
    max_bytes: u64,
) -> Result<(Vec<u8>, bool), OrchestratorError> {
    let size = sftp
        .metadata(remote_path)
        .await
        .map_err(|e| stat_error(remote_path, e))?
        .size
        .unwrap_or(0);

    let mut file = sftp.open(remote_path).await?;
    let (buf, truncated) = read_tail_from(&mut file, size, max_bytes).await?;
    debug!("Read {} of {} bytes from {}", buf.len(), size, remote_path);
    Ok((buf, truncated))
}

/// A missing file is `NotFound`, anything else passes through
fn stat_error(remote_path: &str, err: SftpError) -> OrchestratorError {
    match err {
        SftpError::Status(status) if matches!(status.status_code, StatusCode::NoSuchFile) => {
            OrchestratorError::NotFound(format!("remote file {} does not exist", remote_path))
        }
        other => other.into(),
    }
}
