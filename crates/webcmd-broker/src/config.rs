//! Broker configuration.

use std::time::Duration;

use webcmd_core::DEFAULT_TIMEOUT_SECS;

/// Tunables for queues and timeouts.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Capacity of each connection's private outbound queue. A full queue
    /// drops further events for that node instead of stalling routing.
    pub pump_queue_capacity: usize,
    /// Capacity of the shared inbound (results) queue.
    pub inbound_queue_capacity: usize,
    /// Capacity of the shared outbound (routing) queue.
    pub routing_queue_capacity: usize,
    /// Timeout applied when a request does not name one.
    pub default_timeout: Duration,
    /// Upper bound on any request's timeout.
    pub max_timeout: Duration,
    /// How long a cancelled connection may take to close its socket.
    pub close_grace: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            pump_queue_capacity: 64,
            inbound_queue_capacity: 1024,
            routing_queue_capacity: 1024,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_timeout: Duration::from_secs(24 * 60 * 60),
            close_grace: Duration::from_secs(2),
        }
    }
}
