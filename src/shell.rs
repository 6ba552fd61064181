//! Shell/process boundary
//!
//! Every packet-filter, probe and teardown operation is issued as a single
//! external command with captured output and a bounded timeout. Commands are
//! split on whitespace and executed directly (no `sh -c`), so arguments are
//! never re-interpreted by a shell.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::lock_utils::lock_or_recover;

/// Default timeout for generic child processes (15 minutes)
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Errors from the process boundary
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Empty command")]
    Empty,

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Command '{command}' exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (`None` when killed by a signal)
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion. A non-zero exit is returned as output,
    /// not as an error; only spawn failures and timeouts are errors.
    async fn run(&self, command: &str) -> Result<CommandOutput, ShellError>;

    /// Run a command serialized against other runs of the same command string
    async fn run_exclusive(&self, command: &str) -> Result<CommandOutput, ShellError> {
        self.run(command).await
    }

    /// Run a command and turn a non-zero exit into [`ShellError::Failed`]
    async fn run_checked(&self, command: &str) -> Result<CommandOutput, ShellError> {
        let output = self.run_exclusive(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ShellError::Failed {
                command: command.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Runner backed by `tokio::process`
pub struct ShellRunner {
    timeout: Duration,
    /// One gate per distinct command string
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate_for(&self, command: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = lock_or_recover(&self.gates, "command gates");
        gates
            .entry(command.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput, ShellError> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or(ShellError::Empty)?;

        debug!("exec: {}", command);

        let child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ShellError::Spawn {
                command: command.to_string(),
                source,
            })?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(source)) => Err(ShellError::Spawn {
                command: command.to_string(),
                source,
            }),
            Err(_) => {
                warn!("Command timed out after {:?}: {}", self.timeout, command);
                Err(ShellError::Timeout {
                    command: command.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    async fn run_exclusive(&self, command: &str) -> Result<CommandOutput, ShellError> {
        let gate = self.gate_for(command);
        let _guard = gate.lock().await;
        self.run(command).await
    }
}
