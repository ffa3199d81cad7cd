//! Process-spawning executor.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use webcmd_core::{CommandExecutor, ExecutorError};

use crate::command::CommandParts;

/// Runs each command as a child process and captures its stdout.
///
/// Stdin is closed and stderr is discarded. The child is killed if the
/// execution future is dropped before it exits.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    /// Create a new shell executor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str, args: &[String]) -> Result<Vec<u8>, ExecutorError> {
        let (executable, args) = CommandParts::from_request(command, args)?
            .into_resolved()
            .await?;

        tracing::debug!(executable = %executable.display(), ?args, "Spawning command");

        let child = Command::new(&executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed(format!("{}: {e}", executable.display())))?;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ExecutorError::ExitStatus(output.status));
        }
        Ok(output.stdout)
    }
}
