//! SSH sessions over russh

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use russh::client::{self, AuthResult, Handle, KeyboardInteractiveAuthResponse, Msg};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{Channel, ChannelMsg, Disconnect, MethodKind};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::errors::OrchestratorError;
use crate::remote::ack::{self, AckToken};
use crate::remote::exec::{self, CommandOutput, OutputChunk};
use crate::remote::{sftp, RemoteConnector, RemoteSession, SshTarget};

/// Rounds of empty keyboard-interactive answers before giving up
const MAX_KI_ROUNDS: usize = 3;

/// Accepts any host key. Job VMs are fresh, reached once by IP, and
/// trusted through the key installed by cloud-init.
pub struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Server host key {}",
            server_public_key.fingerprint(Default::default())
        );
        Ok(true)
    }
}

/// Opens real SSH sessions
#[derive(Debug, Clone)]
pub struct SshConnector {
    handshake_timeout: Duration,
}

impl SshConnector {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    async fn handshake(
        &self,
        target: &SshTarget,
        private_key: &SecretString,
    ) -> Result<Handle<ClientHandler>, OrchestratorError> {
        let key = russh::keys::decode_secret_key(private_key.expose_secret(), None)
            .map_err(|e| OrchestratorError::Key(format!("cannot load SSH private key: {}", e)))?;

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let mut handle = client::connect(config, (target.host.as_str(), target.port), ClientHandler)
            .await
            .map_err(|e| OrchestratorError::Connectivity(format!("connect to {}: {}", target, e)))?;

        let result = handle
            .authenticate_publickey(
                target.user.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), None),
            )
            .await
            .map_err(|e| OrchestratorError::Connectivity(format!("auth to {}: {}", target, e)))?;

        match result {
            AuthResult::Success => {}
            AuthResult::Failure {
                remaining_methods, ..
            } if remaining_methods.contains(&MethodKind::KeyboardInteractive) => {
                answer_keyboard_interactive(&mut handle, target).await?;
            }
            AuthResult::Failure { .. } => {
                return Err(OrchestratorError::Connectivity(format!(
                    "public key rejected by {}",
                    target
                )));
            }
        }

        Ok(handle)
    }
}

/// Answer every prompt with an empty string so a misconfigured server
/// fails fast instead of hanging
async fn answer_keyboard_interactive(
    handle: &mut Handle<ClientHandler>,
    target: &SshTarget,
) -> Result<(), OrchestratorError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(target.user.clone(), None)
        .await?;

    for _ in 0..MAX_KI_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(()),
            KeyboardInteractiveAuthResponse::Failure { .. } => break,
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                debug!("Answering {} keyboard-interactive prompts with blanks", prompts.len());
                response = handle
                    .authenticate_keyboard_interactive_respond(vec![String::new(); prompts.len()])
                    .await?;
            }
        }
    }

    Err(OrchestratorError::Connectivity(format!(
        "keyboard-interactive authentication failed for {}",
        target
    )))
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(
        &self,
        target: &SshTarget,
        private_key: &SecretString,
    ) -> Result<Box<dyn RemoteSession>, OrchestratorError> {
        let handle = tokio::time::timeout(self.handshake_timeout, self.handshake(target, private_key))
            .await
            .map_err(|_| {
                OrchestratorError::Connectivity(format!(
                    "SSH handshake with {} timed out after {}s",
                    target,
                    self.handshake_timeout.as_secs()
                ))
            })??;

        info!("SSH session established with {}", target);
        Ok(Box::new(SshSession {
            handle,
            target: target.clone(),
        }))
    }
}

pub struct SshSession {
    handle: Handle<ClientHandler>,
    target: SshTarget,
}

impl SshSession {
    async fn start(&self, command: &str) -> Result<Channel<Msg>, OrchestratorError> {
        let channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;
        Ok(channel)
    }
}

/// Adapt a command channel into a stream that ends on close
fn channel_output(channel: Channel<Msg>) -> impl Stream<Item = OutputChunk> + Unpin {
    Box::pin(stream::unfold(channel, |mut channel| async move {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    return Some((OutputChunk::Stdout(data.to_vec()), channel));
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    return Some((OutputChunk::Stderr(data.to_vec()), channel));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    return Some((OutputChunk::Exit(exit_status), channel));
                }
                Some(ChannelMsg::Close) | None => return None,
                Some(_) => continue,
            }
        }
    }))
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, label: &str, script: &str) -> Result<CommandOutput, OrchestratorError> {
        debug!("[{}] {}", self.target.host, label);
        let channel = self.start(&exec::strict_command(script)).await?;
        let output = exec::collect_output(channel_output(channel)).await;
        exec::check_output(label, output)
    }

    async fn exec_detached(
        &self,
        label: &str,
        launch: &str,
        ack_timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        let token = AckToken::generate();
        let channel = self
            .start(&exec::strict_command(&token.wrap(launch)))
            .await?;
        let outcome = ack::await_ack(channel_output(channel), &token, ack_timeout).await?;
        if !outcome.stderr.is_empty() {
            debug!("[{}] {} stderr: {}", self.target.host, label, outcome.stderr.trim());
        }
        info!("[{}] {} acknowledged", self.target.host, label);
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote_path: &str) -> Result<u64, OrchestratorError> {
        let session = sftp::open(&self.handle).await?;
        let result = sftp::upload_file(&session, local, remote_path).await;
        let _ = session.close().await;
        result
    }

    async fn upload_bytes(&self, contents: &[u8], remote_path: &str) -> Result<(), OrchestratorError> {
        let session = sftp::open(&self.handle).await?;
        let result = sftp::upload_bytes(&session, contents, remote_path).await;
        let _ = session.close().await;
        result
    }

    async fn read_tail(
        &self,
        remote_path: &str,
        max_bytes: u64,
    ) -> Result<(Vec<u8>, bool), OrchestratorError> {
        let session = sftp::open(&self.handle).await?;
        let result = sftp::read_tail(&session, remote_path, max_bytes).await;
        let _ = session.close().await;
        result
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            warn!("Error closing SSH session with {}: {}", self.target, e);
        }
    }
}
