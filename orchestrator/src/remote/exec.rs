//! Synchronous remote commands

use futures::{Stream, StreamExt};

use crate::errors::OrchestratorError;

/// Diagnostic tails kept from a failed command
pub const OUTPUT_TAIL_CHARS: usize = 4000;

/// A piece of output from a remote command channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u32),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the channel closed without reporting a status
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Single-quote `value` for a POSIX shell
pub fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Run `script` under `bash` with errexit, nounset and pipefail
pub fn strict_command(script: &str) -> String {
    format!("bash -c {}", sh_quote(&format!("set -euo pipefail\n{}", script)))
}

/// Last `max_chars` characters of `text`
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// Drain a command channel to completion
pub async fn collect_output<S>(mut chunks: S) -> CommandOutput
where
    S: Stream<Item = OutputChunk> + Unpin,
{
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;

    while let Some(chunk) = chunks.next().await {
        match chunk {
            OutputChunk::Stdout(data) => stdout.extend_from_slice(&data),
            OutputChunk::Stderr(data) => stderr.extend_from_slice(&data),
            OutputChunk::Exit(code) => exit_code = Some(code),
        }
    }

    CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    }
}

/// Turn a non-zero exit into `RemoteCommand` with truncated output
pub fn check_output(label: &str, output: CommandOutput) -> Result<CommandOutput, OrchestratorError> {
    if output.success() {
        return Ok(output);
    }
    let status = output
        .exit_code
        .map(|code| format!("exit status {}", code))
        .unwrap_or_else(|| "no exit status".to_string());
    Err(OrchestratorError::RemoteCommand {
        message: format!("{} failed with {}", label, status),
        stdout: truncate_tail(&output.stdout, OUTPUT_TAIL_CHARS),
        stderr: truncate_tail(&output.stderr, OUTPUT_TAIL_CHARS),
    })
}
