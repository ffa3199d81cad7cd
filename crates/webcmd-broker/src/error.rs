//! Broker error types.

use thiserror::Error;
use webcmd_core::CodecError;

/// Error returned by broker operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker is shut down")]
    Closed,
}

/// Why a request's handle closed without a result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No result arrived before the deadline.
    #[error("Request {0} timed out")]
    TimedOut(String),
    /// The target node was not connected when the request was dispatched.
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    /// A broadcast found no connected nodes.
    #[error("No nodes connected")]
    NoNodesConnected,
    /// Another request with the same id is still pending.
    #[error("Duplicate request id: {0}")]
    DuplicateId(String),
    /// The broker shut down before the request resolved.
    #[error("Broker is shut down")]
    BrokerClosed,
}

/// Socket-level failure on one connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Read failed: {0}")]
    Read(String),
    #[error("Write failed: {0}")]
    Write(String),
    #[error("Close failed: {0}")]
    Close(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
