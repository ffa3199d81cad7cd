//! Command building utilities.

use std::path::{Path, PathBuf};

use webcmd_core::ExecutorError;

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Build parts from a request's command and arguments.
    ///
    /// With explicit arguments the command is taken verbatim as the program.
    /// Without them the command is split shell-style, so `"echo hi"` runs
    /// `echo` with the argument `hi`.
    ///
    /// # Errors
    /// Returns error if the command line cannot be parsed or is empty.
    pub fn from_request(command: &str, args: &[String]) -> Result<Self, ExecutorError> {
        if !args.is_empty() {
            if command.trim().is_empty() {
                return Err(ExecutorError::InvalidCommand("empty command".to_string()));
            }
            return Ok(Self::new(command.to_string(), args.to_vec()));
        }

        let mut parts = split_command_line(command)?;
        if parts.is_empty() {
            return Err(ExecutorError::InvalidCommand("empty command".to_string()));
        }
        let program = parts.remove(0);
        Ok(Self::new(program, parts))
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), ExecutorError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(ExecutorError::ExecutableNotFound(program))?;
        Ok((executable, args))
    }
}

/// Resolve an executable by name.
///
/// Explicit paths (absolute or containing a separator) are used as-is when
/// they point at a file; anything else is looked up on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let name = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(name).ok())
        .await
        .ok()
        .flatten()
}

fn split_command_line(input: &str) -> Result<Vec<String>, ExecutorError> {
    shlex::split(input).ok_or_else(|| ExecutorError::InvalidCommand(input.to_string()))
}
