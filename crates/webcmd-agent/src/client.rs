//! Reconnecting agent client.

use std::sync::Arc;

use futures::{SinkExt, StreamExt, future};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use webcmd_core::CommandExecutor;

use crate::{config::AgentConfig, connection::serve_connection, error::AgentError};

/// Connection state of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Connected,
}

/// Agent that keeps a connection to the broker and executes its commands.
pub struct AgentClient {
    config: AgentConfig,
    executor: Arc<dyn CommandExecutor>,
    state: watch::Sender<AgentState>,
}

impl AgentClient {
    /// Create a new agent client.
    #[must_use]
    pub fn new(config: AgentConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        let (state, _) = watch::channel(AgentState::Disconnected);
        Self {
            config,
            executor,
            state,
        }
    }

    /// Agent configuration.
    #[must_use]
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Connect, serve, and reconnect after a fixed delay, until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let url = &self.config.url;
        loop {
            let outcome = self.connect_once(&cancel).await;
            self.state.send_replace(AgentState::Disconnected);
            if cancel.is_cancelled() {
                break;
            }
            match outcome {
                Ok(()) => tracing::info!(%url, "Connection closed"),
                Err(e) => tracing::warn!(%url, "Connection lost: {e}"),
            }

            tracing::info!(
                %url,
                delay_ms = u64::try_from(self.config.reconnect_delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting after delay"
            );
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        tracing::info!(%url, "Agent stopped");
    }

    /// Dial the broker once and serve the connection until it ends.
    ///
    /// # Errors
    /// Returns error if the dial fails or the connection breaks.
    pub async fn connect_once(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        let url = &self.config.url;
        self.state.send_replace(AgentState::Connecting);
        tracing::info!(%url, "Connecting to broker");

        let dialed = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            dialed = connect_async(url.as_str()) => dialed,
        };
        let (socket, _) = dialed.map_err(|e| AgentError::Connect(e.to_string()))?;
        self.state.send_replace(AgentState::Connected);
        tracing::info!(%url, "Connected to broker");

        let (sender, receiver) = socket.split();
        let reader = receiver
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().as_bytes().to_vec())),
                    Ok(Message::Binary(data)) => Some(Ok(data.to_vec())),
                    Ok(_) => None,
                    Err(e) => Some(Err(AgentError::Read(e.to_string()))),
                })
            })
            .boxed();
        let writer = Box::pin(
            sender
                .with(|frame: String| {
                    future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(Message::Text(
                        frame.into(),
                    )))
                })
                .sink_map_err(|e| AgentError::Write(e.to_string())),
        );

        serve_connection(
            reader,
            writer,
            Arc::clone(&self.executor),
            cancel,
            self.config.outbound_queue_capacity,
            self.config.close_grace,
        )
        .await
    }
}
