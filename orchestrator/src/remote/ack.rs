//! Acknowledged launch of detached remote processes
//!
//! A launch command backgrounds the real work, records its PID and then
//! prints a single-use token on its own line. Seeing that exact line on
//! stdout is the only signal that the process started; the channel may close
//! or stay open afterwards, it no longer matters.

use std::time::Duration;

use futures::{Stream, StreamExt};

use crate::errors::OrchestratorError;
use crate::remote::exec::{truncate_tail, OutputChunk, OUTPUT_TAIL_CHARS};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Random sentinel printed after a successful launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken(String);

impl AckToken {
    pub fn generate() -> Self {
        Self(format!("OPTIMIZERD-ACK-{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append the acknowledgment to a launch script. Under errexit the echo
    /// only runs when every preceding line succeeded.
    pub fn wrap(&self, launch: &str) -> String {
        format!("{}\necho {}", launch.trim_end(), self.0)
    }
}

impl From<&str> for AckToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Matches a token only when it makes up an entire stdout line
#[derive(Debug)]
pub struct AckScanner {
    token: Vec<u8>,
    line: Vec<u8>,
}

impl AckScanner {
    pub fn new(token: &AckToken) -> Self {
        Self {
            token: token.as_str().as_bytes().to_vec(),
            line: Vec::new(),
        }
    }

    /// Feed stdout bytes; true once a complete line equals the token
    pub fn feed(&mut self, data: &[u8]) -> bool {
        for &byte in data {
            if byte == b'\n' {
                let line = self.line.strip_suffix(b"\r").unwrap_or(&self.line[..]);
                if line == self.token.as_slice() {
                    self.line.clear();
                    return true;
                }
                self.line.clear();
            } else if self.line.len() <= self.token.len() {
                // one byte past the token length is enough to rule a line out
                self.line.push(byte);
            }
        }
        false
    }
}

/// Output seen before the token arrived
#[derive(Debug, Default, Clone)]
pub struct AckOutcome {
    pub stdout: String,
    pub stderr: String,
}

/// Watch `chunks` for `token` for up to `timeout`
pub async fn await_ack<S>(
    mut chunks: S,
    token: &AckToken,
    timeout: Duration,
) -> Result<AckOutcome, OrchestratorError>
where
    S: Stream<Item = OutputChunk> + Unpin,
{
    let mut scanner = AckScanner::new(token);
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;

    let watch = async {
        while let Some(chunk) = chunks.next().await {
            match chunk {
                OutputChunk::Stdout(data) => {
                    stdout.extend_from_slice(&data);
                    if scanner.feed(&data) {
                        return true;
                    }
                }
                OutputChunk::Stderr(data) => stderr.extend_from_slice(&data),
                OutputChunk::Exit(code) => exit_code = Some(code),
            }
        }
        false
    };

    let acked = tokio::time::timeout(timeout, watch).await;
    let stdout = truncate_tail(&String::from_utf8_lossy(&stdout), OUTPUT_TAIL_CHARS);
    let stderr = truncate_tail(&String::from_utf8_lossy(&stderr), OUTPUT_TAIL_CHARS);

    match acked {
        Ok(true) => Ok(AckOutcome { stdout, stderr }),
        Ok(false) => Err(OrchestratorError::RemoteCommand {
            message: match exit_code {
                Some(code) => format!("launch exited with status {} before acknowledging", code),
                None => "launch channel closed before acknowledging".to_string(),
            },
            stdout,
            stderr,
        }),
        Err(_) => Err(OrchestratorError::AckTimeout {
            timeout_secs: timeout.as_secs(),
            stdout,
            stderr,
        }),
    }
}
