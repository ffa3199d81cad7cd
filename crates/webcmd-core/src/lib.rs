//! Core abstractions shared by the webcmd broker and agent.
//!
//! This crate provides the fundamental building blocks:
//! - `CommandEvent` / `CommandResult` - the two wire messages and their codec
//! - `node_identity` - node key normalization from peer addresses
//! - `CommandExecutor` - pluggable command execution trait

pub mod node;
pub mod protocol;
pub mod traits;

pub use node::{node_identity, node_identity_from_addr};
pub use protocol::{CodecError, CommandEvent, CommandResult, DEFAULT_TIMEOUT_SECS};
pub use traits::{CommandExecutor, ExecutorError};
