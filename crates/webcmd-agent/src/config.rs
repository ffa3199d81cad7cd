//! Agent configuration.

use std::time::Duration;

/// Path of the broker's agent endpoint.
pub const EVENTS_PATH: &str = "/events";

/// Agent connection settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Broker WebSocket URL.
    pub url: String,
    /// Delay between a disconnect and the next connect attempt.
    pub reconnect_delay: Duration,
    /// Capacity of the queue of results waiting to be written.
    pub outbound_queue_capacity: usize,
    /// How long closing the socket may take.
    pub close_grace: Duration,
}

impl AgentConfig {
    /// Create a config for a broker address.
    ///
    /// Accepts a full `ws://` / `wss://` URL, or a bare `host:port` which is
    /// expanded to `ws://host:port/events`.
    #[must_use]
    pub fn new(broker: &str) -> Self {
        Self {
            url: broker_url(broker),
            reconnect_delay: Duration::from_secs(5),
            outbound_queue_capacity: 64,
            close_grace: Duration::from_secs(2),
        }
    }

    /// Set the reconnect delay.
    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

fn broker_url(broker: &str) -> String {
    let broker = broker.trim();
    if broker.starts_with("ws://") || broker.starts_with("wss://") {
        broker.to_string()
    } else {
        format!("ws://{}{EVENTS_PATH}", broker.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_address_expanded() {
        assert_eq!(AgentConfig::new("10.0.0.1:8080").url, "ws://10.0.0.1:8080/events");
        assert_eq!(AgentConfig::new("broker:80/").url, "ws://broker:80/events");
    }

    #[test]
    fn test_full_url_kept() {
        assert_eq!(
            AgentConfig::new("wss://broker.example/agents").url,
            "wss://broker.example/agents"
        );
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::new("h:1");
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(
            config.with_reconnect_delay(Duration::from_millis(10)).reconnect_delay,
            Duration::from_millis(10)
        );
    }
}
