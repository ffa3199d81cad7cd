//! Wire protocol between broker and agents.
//!
//! Every message travels as one self-contained JSON frame. Byte payloads are
//! base64 encoded (standard alphabet).

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

const fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Frame codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Command execution request, broker to agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvent {
    /// Unique request identifier.
    #[serde(default)]
    pub id: String,
    /// Target node. Empty means broadcast.
    #[serde(default)]
    pub node: String,
    /// Command to run.
    pub cmd: String,
    /// Ordered command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Absolute expiry instant. A missing value is treated as already expired.
    #[serde(default)]
    pub end_time: DateTime<Utc>,
}

impl CommandEvent {
    /// Create a broadcast event with the default timeout and no id.
    #[must_use]
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            node: String::new(),
            cmd: cmd.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT_SECS,
            end_time: DateTime::<Utc>::default(),
        }
    }

    /// Target a single node.
    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    /// Set the command arguments.
    #[must_use]
    pub fn with_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the timeout in seconds.
    #[must_use]
    pub const fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    /// Whether this event goes to every registered node.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.node.is_empty()
    }

    /// Timeout as a duration.
    #[must_use]
    pub const fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Stamp `end_time` as `now + timeout`.
    pub fn stamp_deadline(&mut self, now: DateTime<Utc>) {
        self.end_time = i64::try_from(self.timeout)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Whether the deadline has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.end_time
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Captured output of one command, agent to broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Id of the originating `CommandEvent`.
    pub id: String,
    /// Captured output, or the error text when execution failed.
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl CommandResult {
    /// Create a result.
    #[must_use]
    pub fn new(id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
        }
    }

    /// Payload as lossy UTF-8.
    #[must_use]
    pub fn data_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Encode a message into one text frame.
///
/// # Errors
/// Returns error if the message cannot be serialized.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(CodecError::Encode)
}

/// Decode one frame (text or UTF-8 binary) into a message.
///
/// # Errors
/// Returns error if the frame is not a valid message of type `T`.
pub fn decode<T: DeserializeOwned>(frame: impl AsRef<[u8]>) -> Result<T, CodecError> {
    serde_json::from_slice(frame.as_ref()).map_err(CodecError::Decode)
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => BASE64.decode(s.as_bytes()).map_err(D::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
