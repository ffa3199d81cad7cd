//! Broker tasks and their client handle.
//!
//! The broker runs two tasks under one cancellation token:
//! - routing: owns the node registry; registers and unregisters pumps and
//!   dispatches outbound events
//! - correlation: owns the correlation table; tracks pending requests,
//!   resolves arriving results and expires deadlines
//!
//! Nothing else touches either table. Everyone else talks to them through
//! [`BrokerHandle`].

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use futures::{Sink, Stream};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webcmd_core::CommandEvent;

use crate::{
    config::BrokerConfig,
    correlation::{CorrelationTable, Inbound, PendingRequest, ResultHandle},
    error::{BrokerError, CommandError, TransportError},
    pump::{ConnId, ConnectionPump, PumpHandle},
    registry::{Dispatch, Registry},
};

/// Message on the routing task's queue.
#[derive(Debug)]
enum Routing {
    Register(PumpHandle),
    Unregister { node: String, conn: ConnId },
    Disconnect { node: String, reply: oneshot::Sender<bool> },
    Dispatch(CommandEvent),
    Nodes(oneshot::Sender<Vec<String>>),
}

/// The running broker.
pub struct Broker {
    handle: BrokerHandle,
    routing_task: JoinHandle<()>,
    correlation_task: JoinHandle<()>,
}

impl Broker {
    /// Spawn the routing and correlation tasks.
    #[must_use]
    pub fn start(config: BrokerConfig) -> Self {
        let cancel = CancellationToken::new();
        let (routing_tx, routing_rx) = mpsc::channel(config.routing_queue_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity.max(1));

        let routing_task = tokio::spawn(routing_loop(routing_rx, inbound_tx.clone(), cancel.clone()));
        let correlation_task = tokio::spawn(correlation_loop(inbound_rx, cancel.clone()));

        let handle = BrokerHandle {
            routing: routing_tx,
            inbound: inbound_tx,
            cancel,
            next_conn: Arc::new(AtomicU64::new(1)),
            config: Arc::new(config),
        };

        Self {
            handle,
            routing_task,
            correlation_task,
        }
    }

    /// Get a handle for sending commands and attaching connections.
    #[must_use]
    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Stop both tasks and every connection.
    ///
    /// Pending requests resolve with [`CommandError::BrokerClosed`].
    pub async fn shutdown(self) {
        self.handle.cancel.cancel();
        let _ = self.routing_task.await;
        let _ = self.correlation_task.await;
        tracing::info!("Broker stopped");
    }
}

/// Cloneable handle to a running broker.
#[derive(Clone)]
pub struct BrokerHandle {
    routing: mpsc::Sender<Routing>,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    next_conn: Arc<AtomicU64>,
    config: Arc<BrokerConfig>,
}

impl BrokerHandle {
    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Whether the broker has been shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send a command to `node` (empty for broadcast).
    ///
    /// `timeout` is in seconds; `None` uses the configured default.
    ///
    /// # Errors
    /// Returns error if the broker is shut down.
    pub async fn send_command(
        &self,
        node: impl Into<String>,
        cmd: impl Into<String>,
        args: Vec<String>,
        timeout: Option<u64>,
    ) -> Result<ResultHandle, BrokerError> {
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout.as_secs());
        let event = CommandEvent::new(cmd)
            .with_node(node)
            .with_args(args)
            .with_timeout(timeout);
        self.send(event).await
    }

    /// Send an event and return the handle its result will arrive on.
    ///
    /// Assigns an id if the event has none and stamps its deadline. Returns
    /// as soon as the event is queued for routing.
    ///
    /// # Errors
    /// Returns error if the broker is shut down.
    pub async fn send(&self, mut event: CommandEvent) -> Result<ResultHandle, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }
        event.timeout = event.timeout.min(self.config.max_timeout.as_secs());
        let deadline = Instant::now() + event.timeout_duration();
        event.stamp_deadline(Utc::now());

        let (handle, slot) = ResultHandle::new(event.id.clone());
        let pending = PendingRequest {
            id: event.id.clone(),
            deadline,
            slot,
        };

        tracing::debug!(id = %event.id, node = %event.node, cmd = %event.cmd, "Sending command");

        // Tracking is queued before dispatch so a result can never overtake it.
        self.inbound
            .send(Inbound::Track(pending))
            .await
            .map_err(|_| BrokerError::Closed)?;
        self.routing
            .send(Routing::Dispatch(event))
            .await
            .map_err(|_| BrokerError::Closed)?;

        Ok(handle)
    }

    /// Attach a live connection for `node` and start its pump.
    ///
    /// Supersedes any existing connection registered under the same node.
    ///
    /// # Errors
    /// Returns error if the broker is shut down; the connection is dropped.
    pub async fn attach<R, W>(
        &self,
        node: impl Into<String>,
        reader: R,
        writer: W,
    ) -> Result<ConnId, BrokerError>
    where
        R: Stream<Item = Result<Vec<u8>, TransportError>> + Unpin + Send + 'static,
        W: Sink<String, Error = TransportError> + Unpin + Send + 'static,
    {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let node = node.into();
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (pump, handle) = ConnectionPump::new(
            node.clone(),
            conn,
            reader,
            writer,
            self.inbound.clone(),
            &self.cancel,
            self.config.pump_queue_capacity,
            self.config.close_grace,
        );

        self.routing
            .send(Routing::Register(handle))
            .await
            .map_err(|_| BrokerError::Closed)?;

        let routing = self.routing.clone();
        tokio::spawn(async move {
            if let Err(e) = pump.run().await {
                tracing::warn!(%node, conn, "Connection failed: {e}");
            }
            let _ = routing.send(Routing::Unregister { node, conn }).await;
        });

        Ok(conn)
    }

    /// Cancel a node's connection. Returns false if it was not connected.
    ///
    /// # Errors
    /// Returns error if the broker is shut down.
    pub async fn disconnect(&self, node: impl Into<String>) -> Result<bool, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.routing
            .send(Routing::Disconnect {
                node: node.into(),
                reply,
            })
            .await
            .map_err(|_| BrokerError::Closed)?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    /// Currently registered node identities, sorted.
    ///
    /// # Errors
    /// Returns error if the broker is shut down.
    pub async fn nodes(&self) -> Result<Vec<String>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.routing
            .send(Routing::Nodes(reply))
            .await
            .map_err(|_| BrokerError::Closed)?;
        rx.await.map_err(|_| BrokerError::Closed)
    }
}

async fn routing_loop(
    mut queue: mpsc::Receiver<Routing>,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    let mut registry = Registry::new();

    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = queue.recv() => msg,
        };
        let Some(msg) = msg else { break };

        match msg {
            Routing::Register(pump) => {
                let (node, conn) = (pump.node().to_string(), pump.conn());
                if let Some(old) = registry.register(pump) {
                    tracing::warn!(%node, old = old.conn(), new = conn, "Node reconnected, superseding old connection");
                } else {
                    tracing::info!(%node, conn, "Node registered");
                }
            }
            Routing::Unregister { node, conn } => {
                if registry.unregister_connection(&node, conn) {
                    tracing::info!(%node, conn, "Node unregistered");
                }
            }
            Routing::Disconnect { node, reply } => {
                let found = registry.unregister(&node).inspect(PumpHandle::cancel).is_some();
                let _ = reply.send(found);
            }
            Routing::Dispatch(event) => {
                let reason = match registry.dispatch(&event) {
                    Dispatch::Queued(queued) => {
                        tracing::trace!(id = %event.id, queued, "Event dispatched");
                        None
                    }
                    Dispatch::NodeNotFound => Some(CommandError::NodeNotFound(event.node.clone())),
                    Dispatch::NoNodes => Some(CommandError::NoNodesConnected),
                };
                if let Some(reason) = reason {
                    let msg = Inbound::Unroutable {
                        id: event.id,
                        reason,
                    };
                    // The correlation task never waits on routing, so this cannot deadlock.
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        sent = inbound.send(msg) => {
                            if sent.is_err() {
                                tracing::debug!("Correlation task gone, unroutable note dropped");
                            }
                        }
                    }
                }
            }
            Routing::Nodes(reply) => {
                let _ = reply.send(registry.nodes());
            }
        }
    }

    registry.cancel_all();
    tracing::debug!("Routing task stopped");
}

async fn correlation_loop(mut queue: mpsc::Receiver<Inbound>, cancel: CancellationToken) {
    let mut table = CorrelationTable::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            msg = queue.recv() => match msg {
                Some(Inbound::Track(pending)) => table.track(pending),
                Some(Inbound::Result { node, result }) => {
                    tracing::trace!(%node, id = %result.id, "Resolving result");
                    table.resolve(result);
                }
                Some(Inbound::Unroutable { id, reason }) => table.mark_unroutable(&id, reason),
                None => break,
            },
            id = table.expire_next() => {
                tracing::debug!(%id, "Deadline reached");
            }
        }
    }

    tracing::debug!(pending = table.len(), "Correlation task stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt, channel::mpsc as fmpsc};
    use webcmd_core::{CommandResult, protocol};

    use super::*;

    /// Test side of a fake socket.
    struct Peer {
        tx: fmpsc::UnboundedSender<Result<Vec<u8>, TransportError>>,
        rx: fmpsc::UnboundedReceiver<String>,
    }

    impl Peer {
        async fn next_event(&mut self) -> CommandEvent {
            let frame = self.rx.next().await.expect("connection closed");
            protocol::decode(&frame).unwrap()
        }

        fn reply(&self, id: &str, data: &[u8]) {
            let frame = protocol::encode(&CommandResult::new(id, data.to_vec())).unwrap();
            self.tx.unbounded_send(Ok(frame.into_bytes())).unwrap();
        }
    }

    async fn connect(broker: &BrokerHandle, node: &str) -> Peer {
        let (tx, reader) = fmpsc::unbounded();
        let (writer, rx) = fmpsc::unbounded::<String>();
        let writer = writer.sink_map_err(|e| TransportError::Write(e.to_string()));
        broker.attach(node, reader, writer).await.unwrap();
        Peer { tx, rx }
    }

    async fn wait_until_absent(broker: &BrokerHandle, node: &str) {
        while broker.nodes().await.unwrap().iter().any(|n| n == node) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_correlated_to_caller() {
        let broker = Broker::start(BrokerConfig::default());
        let handle = broker.handle();
        let mut peer = connect(&handle, "n1").await;

        let pending = handle
            .send_command("n1", "echo hi", Vec::new(), None)
            .await
            .unwrap();
        let event = peer.next_event().await;
        assert_eq!(event.id, pending.id());
        assert_eq!(event.node, "n1");
        assert_eq!(event.timeout, 10);
        peer.reply(&event.id, b"hi\n");

        let result = pending.wait().await.unwrap();
        assert_eq!(result.data, b"hi\n");
        broker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_closes_handle_and_drops_late_result() {
        let broker = Broker::start(BrokerConfig::default());
        let handle = broker.handle();
        let mut peer = connect(&handle, "n1").await;

        let start = Instant::now();
        let pending = handle
            .send_command("n1", "sleep 60", Vec::new(), Some(3))
            .await
            .unwrap();
        let id = pending.id().to_string();
        let event = peer.next_event().await;

        assert_eq!(pending.wait().await, Err(CommandError::TimedOut(id)));
        assert!(start.elapsed() >= Duration::from_secs(3));

        // A late answer is dropped and the connection keeps working.
        peer.reply(&event.id, b"late");
        let next = handle
            .send_command("n1", "true", Vec::new(), None)
            .await
            .unwrap();
        let event = peer.next_event().await;
        peer.reply(&event.id, b"fresh");
        assert_eq!(next.wait().await.unwrap().data, b"fresh");
        broker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_node_waits_full_timeout() {
        let broker = Broker::start(BrokerConfig::default());
        let handle = broker.handle();

        let start = Instant::now();
        let ghost = handle
            .send_command("ghost", "echo hi", Vec::new(), None)
            .await
            .unwrap();
        assert_eq!(
            ghost.wait().await,
            Err(CommandError::NodeNotFound("ghost".into()))
        );
        assert!(start.elapsed() >= Duration::from_secs(10));

        // Routing still works afterwards.
        let mut peer = connect(&handle, "n1").await;
        let pending = handle
            .send_command("n1", "true", Vec::new(), None)
            .await
            .unwrap();
        let event = peer.next_event().await;
        peer.reply(&event.id, b"");
        assert!(pending.wait().await.is_ok());
        broker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_node_reported_with_busy_inbound_queue() {
        let broker = Broker::start(BrokerConfig {
            inbound_queue_capacity: 1,
            ..BrokerConfig::default()
        });
        let handle = broker.handle();

        let requests = (0..50).map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .send_command("ghost", "uptime", Vec::new(), Some(1))
                    .await
                    .unwrap()
                    .wait()
                    .await
            })
        });
        let outcomes = futures::future::join_all(requests).await;

        assert_eq!(outcomes.len(), 50);
        for outcome in outcomes {
            assert_eq!(
                outcome.unwrap(),
                Err(CommandError::NodeNotFound("ghost".into()))
            );
        }
        broker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_results() {
        let broker = Broker::start(BrokerConfig::default());
        let handle = broker.handle();
        let mut peer = connect(&handle, "n1").await;

        let a = handle.send_command("n1", "slow", Vec::new(), None).await.unwrap();
        let b = handle.send_command("n1", "fast", Vec::new(), None).await.unwrap();
        let first = peer.next_event().await;
        let second = peer.next_event().await;
        assert_eq!(first.cmd, "slow");
        assert_eq!(second.cmd, "fast");

        peer.reply(&second.id, b"B");
        peer.reply(&first.id, b"A");

        let b = b.wait().await.unwrap();
        let a = a.wait().await.unwrap();
        assert_eq!((a.id, a.data), (first.id, b"A".to_vec()));
        assert_eq!((b.id, b.data), (second.id, b"B".to_vec()));
        broker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_first_result_wins() {
        let broker = Broker::start(BrokerConfig::default());
        let handle = broker.handle();
        let mut one = connect(&handle, "n1").await;
        let mut two = connect(&handle, "n2").await;

        let pending = handle.send_command("", "hostname", Vec::new(), None).await.unwrap();
        let e1 = one.next_event().await;
        let e2 = two.next_event().await;
        assert_eq!(e1.id, e2.id);
        assert!(e1.is_broadcast());

        two.reply(&e2.id, b"two");
        one.reply(&e1.id, b"one");
        assert_eq!(pending.wait().await.unwrap().data, b"two");
        broker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_without_nodes() {
        let broker = Broker::start(BrokerConfig::default());
        let pending = broker
            .handle()
            .send_command("", "hostname", Vec::new(), Some(1))
            .await
            .unwrap();
        assert_eq!(pending.wait().await, Err(CommandError::NoNodesConnected));
        broker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_supersedes_and_old_teardown_keeps_new() {
        let broker = Broker::start(BrokerConfig::default());
        let handle = broker.handle();
        let old = connect(&handle, "n1").await;
        let mut new = connect(&handle, "n1").await;

        // Old socket dies after being superseded.
        drop(old);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.nodes().await.unwrap(), vec!["n1".to_string()]);

        let pending = handle.send_command("n1", "id", Vec::new(), None).await.unwrap();
        let event = new.next_event().await;
        new.reply(&event.id, b"uid=0");
        assert_eq!(pending.wait().await.unwrap().data, b"uid=0");
        broker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure_unregisters_node() {
        let broker = Broker::start(BrokerConfig::default());
        let handle = broker.handle();
        let mut peer = connect(&handle, "n1").await;

        peer.tx.unbounded_send(Ok(b"{not json".to_vec())).unwrap();
        wait_until_absent(&handle, "n1").await;
        assert!(peer.rx.next().await.is_none());
        broker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_socket() {
        let broker = Broker::start(BrokerConfig::default());
        let handle = broker.handle();
        let mut peer = connect(&handle, "n1").await;

        assert!(handle.disconnect("n1").await.unwrap());
        assert!(!handle.disconnect("n1").await.unwrap());
        assert!(peer.rx.next().await.is_none());
        assert!(handle.nodes().await.unwrap().is_empty());
        broker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_everything() {
        let broker = Broker::start(BrokerConfig::default());
        let handle = broker.handle();
        let mut peer = connect(&handle, "n1").await;
        let pending = handle.send_command("n1", "sleep 5", Vec::new(), None).await.unwrap();
        let _ = peer.next_event().await;

        broker.shutdown().await;

        assert_eq!(pending.wait().await, Err(CommandError::BrokerClosed));
        assert!(peer.rx.next().await.is_none());
        assert!(handle.is_closed());
        assert_eq!(
            handle.send_command("n1", "true", Vec::new(), None).await.err(),
            Some(BrokerError::Closed)
        );
    }

    #[tokio::test]
    async fn test_ids_unique_under_rapid_sends() {
        let broker = Broker::start(BrokerConfig::default());
        let handle = broker.handle();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..500 {
            let pending = handle.send_command("", "x", Vec::new(), Some(1)).await.unwrap();
            assert!(ids.insert(pending.id().to_string()));
        }
        broker.shutdown().await;
    }
}
