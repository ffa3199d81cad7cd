//! Agent-side client for the webcmd broker.
//!
//! Dials the broker, executes received commands through a pluggable
//! [`CommandExecutor`](webcmd_core::CommandExecutor) and sends the captured
//! output back, reconnecting after any connection failure.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;

pub use client::{AgentClient, AgentState};
pub use config::AgentConfig;
pub use connection::serve_connection;
pub use error::AgentError;
