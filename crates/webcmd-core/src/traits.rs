//! Core traits for command execution.

use async_trait::async_trait;
use thiserror::Error;

/// Executor error.
///
/// The display text of this error is what the agent sends back as the
/// result payload when a command fails.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Invalid command line: {0}")]
    InvalidCommand(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    ExitStatus(std::process::ExitStatus),
}

/// Trait for pluggable command executors.
///
/// Implementations run one command to completion and return its captured
/// output. They may be invoked concurrently.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` with `args` and capture its output.
    async fn execute(&self, command: &str, args: &[String]) -> Result<Vec<u8>, ExecutorError>;
}
