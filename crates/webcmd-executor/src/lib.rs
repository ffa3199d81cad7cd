//! Default command executor for webcmd agents.
//!
//! Provides:
//! - Command line splitting and executable resolution
//! - `ShellExecutor` - runs a process and captures its stdout

pub mod command;
pub mod shell;

pub use command::{CommandParts, resolve_executable_path};
pub use shell::ShellExecutor;
