//! Agent error types.

use thiserror::Error;
use webcmd_core::CodecError;

/// Error that ends one connection to the broker.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to connect: {0}")]
    Connect(String),
    #[error("Read failed: {0}")]
    Read(String),
    #[error("Write failed: {0}")]
    Write(String),
    #[error("Connection closed by broker")]
    ConnectionClosed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}
