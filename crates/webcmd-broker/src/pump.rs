//! Per-connection pump.
//!
//! A pump owns one socket, split into a frame stream and a frame sink, plus a
//! private outbound queue. Two loops run over it:
//! - outbound: drains the queue onto the wire, one frame per event
//! - inbound: decodes result frames and forwards them to the shared inbound
//!   queue
//!
//! Either loop failing cancels the pump's token, which stops the other one,
//! so a connection always closes as a whole.

use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webcmd_core::{CommandEvent, CommandResult, protocol};

use crate::{correlation::Inbound, error::TransportError};

/// Serial number distinguishing successive connections of one node.
pub type ConnId = u64;

/// Registry-side handle to a running pump.
#[derive(Debug, Clone)]
pub struct PumpHandle {
    node: String,
    conn: ConnId,
    outbound: mpsc::Sender<CommandEvent>,
    cancel: CancellationToken,
}

/// Why an event could not be queued on a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The pump's outbound queue is at capacity.
    Full,
    /// The pump is closing or closed.
    Closed,
}

impl PumpHandle {
    pub const fn new(
        node: String,
        conn: ConnId,
        outbound: mpsc::Sender<CommandEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node,
            conn,
            outbound,
            cancel,
        }
    }

    /// Node identity this pump serves.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Connection serial number.
    #[must_use]
    pub const fn conn(&self) -> ConnId {
        self.conn
    }

    /// Whether the pump has started closing.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue an event without waiting.
    ///
    /// # Errors
    /// Returns error if the queue is full or the pump is closing.
    pub fn try_enqueue(&self, event: CommandEvent) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Ask both loops to stop and release the socket.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// One connection's inbound and outbound loops.
pub struct ConnectionPump<R, W> {
    node: String,
    conn: ConnId,
    reader: R,
    writer: W,
    outbound: mpsc::Receiver<CommandEvent>,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    close_grace: Duration,
}

impl<R, W> ConnectionPump<R, W>
where
    R: Stream<Item = Result<Vec<u8>, TransportError>> + Unpin + Send,
    W: Sink<String, Error = TransportError> + Unpin + Send,
{
    /// Create a pump and its registry handle.
    ///
    /// The pump's token is a child of `parent`, so cancelling the parent
    /// tears the connection down.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: String,
        conn: ConnId,
        reader: R,
        writer: W,
        inbound: mpsc::Sender<Inbound>,
        parent: &CancellationToken,
        queue_capacity: usize,
        close_grace: Duration,
    ) -> (Self, PumpHandle) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let cancel = parent.child_token();
        let handle = PumpHandle::new(node.clone(), conn, tx, cancel.clone());
        let pump = Self {
            node,
            conn,
            reader,
            writer,
            outbound: rx,
            inbound,
            cancel,
            close_grace,
        };
        (pump, handle)
    }

    /// Run both loops until the connection closes.
    ///
    /// Returns the first error that ended either loop.
    ///
    /// # Errors
    /// Returns the transport or decode error that tore the connection down.
    pub async fn run(self) -> Result<(), TransportError> {
        let Self {
            node,
            conn,
            reader,
            writer,
            outbound,
            inbound,
            cancel,
            close_grace,
        } = self;

        tracing::info!(%node, conn, "Connection open");

        let (read_result, write_result) = tokio::join!(
            inbound_loop(&node, reader, &inbound, &cancel),
            outbound_loop(&node, writer, outbound, &cancel, close_grace),
        );

        tracing::info!(%node, conn, "Connection closed");
        read_result.and(write_result)
    }
}

async fn outbound_loop<W>(
    node: &str,
    mut writer: W,
    mut queue: mpsc::Receiver<CommandEvent>,
    cancel: &CancellationToken,
    close_grace: Duration,
) -> Result<(), TransportError>
where
    W: Sink<String, Error = TransportError> + Unpin,
{
    let result = loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            event = queue.recv() => event,
        };
        let Some(event) = event else {
            break Ok(());
        };

        let frame = match protocol::encode(&event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(node, id = %event.id, "Failed to encode event: {e}");
                continue;
            }
        };

        let sent = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            sent = writer.send(frame) => sent,
        };
        if let Err(e) = sent {
            tracing::warn!(node, "Write failed: {e}");
            break Err(e);
        }
        tracing::debug!(node, id = %event.id, "Event written");
    };

    cancel.cancel();
    match tokio::time::timeout(close_grace, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(node, "Close failed: {e}"),
        Err(_) => tracing::debug!(node, "Close timed out"),
    }
    result
}

async fn inbound_loop<R>(
    node: &str,
    mut reader: R,
    inbound: &mpsc::Sender<Inbound>,
    cancel: &CancellationToken,
) -> Result<(), TransportError>
where
    R: Stream<Item = Result<Vec<u8>, TransportError>> + Unpin,
{
    let result = loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            frame = reader.next() => frame,
        };

        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::warn!(node, "Read failed: {e}");
                break Err(e);
            }
            None => break Ok(()),
        };

        let result: CommandResult = match protocol::decode(&bytes) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(node, "Undecodable frame: {e}");
                break Err(e.into());
            }
        };
        tracing::debug!(node, id = %result.id, "Result received");

        let msg = Inbound::Result {
            node: node.to_string(),
            result,
        };
        let forwarded = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            forwarded = inbound.send(msg) => forwarded,
        };
        if forwarded.is_err() {
            break Ok(());
        }
    };

    cancel.cancel();
    drop(reader);
    result
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc as fmpsc;

    use super::*;

    type PeerTx = fmpsc::UnboundedSender<Result<Vec<u8>, TransportError>>;
    type PeerRx = fmpsc::UnboundedReceiver<String>;

    fn spawn_pump(
        inbound: mpsc::Sender<Inbound>,
        parent: &CancellationToken,
    ) -> (PumpHandle, tokio::task::JoinHandle<Result<(), TransportError>>, PeerTx, PeerRx) {
        let (peer_tx, reader) = fmpsc::unbounded();
        let (writer, peer_rx) = fmpsc::unbounded::<String>();
        let writer = writer.sink_map_err(|e| TransportError::Write(e.to_string()));
        let (pump, handle) = ConnectionPump::new(
            "n1".to_string(),
            1,
            reader,
            writer,
            inbound,
            parent,
            4,
            Duration::from_secs(1),
        );
        (handle, tokio::spawn(pump.run()), peer_tx, peer_rx)
    }

    #[tokio::test]
    async fn test_events_written_in_order() {
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let root = CancellationToken::new();
        let (handle, _task, _peer_tx, mut peer_rx) = spawn_pump(inbound_tx, &root);

        for id in ["a", "b", "c"] {
            let mut event = CommandEvent::new("true").with_node("n1");
            event.id = id.to_string();
            handle.try_enqueue(event).unwrap();
        }

        for id in ["a", "b", "c"] {
            let frame = peer_rx.next().await.unwrap();
            let event: CommandEvent = protocol::decode(&frame).unwrap();
            assert_eq!(event.id, id);
        }
    }

    #[tokio::test]
    async fn test_results_forwarded_to_inbound_queue() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let root = CancellationToken::new();
        let (_handle, _task, peer_tx, _peer_rx) = spawn_pump(inbound_tx, &root);

        let frame = protocol::encode(&CommandResult::new("x", b"out".to_vec())).unwrap();
        peer_tx.unbounded_send(Ok(frame.into_bytes())).unwrap();

        match inbound_rx.recv().await.unwrap() {
            Inbound::Result { node, result } => {
                assert_eq!(node, "n1");
                assert_eq!(result, CommandResult::new("x", b"out".to_vec()));
            }
            _ => panic!("expected a result"),
        }
    }

    #[tokio::test]
    async fn test_decode_failure_closes_both_directions() {
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let root = CancellationToken::new();
        let (handle, task, peer_tx, mut peer_rx) = spawn_pump(inbound_tx, &root);

        peer_tx.unbounded_send(Ok(b"garbage".to_vec())).unwrap();

        let exit = task.await.unwrap();
        assert!(matches!(exit, Err(TransportError::Codec(_))));
        assert!(handle.is_closed());
        // Writer half was closed too.
        assert!(peer_rx.next().await.is_none());
        assert_eq!(
            handle.try_enqueue(CommandEvent::new("true")),
            Err(EnqueueError::Closed)
        );
    }

    #[tokio::test]
    async fn test_peer_hangup_ends_pump() {
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let root = CancellationToken::new();
        let (handle, task, peer_tx, mut peer_rx) = spawn_pump(inbound_tx, &root);

        drop(peer_tx);

        assert!(task.await.unwrap().is_ok());
        assert!(handle.is_closed());
        assert!(peer_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_both_loops() {
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let root = CancellationToken::new();
        let (handle, task, _peer_tx, mut peer_rx) = spawn_pump(inbound_tx, &root);

        root.cancel();

        let exit = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("pump did not stop")
            .unwrap();
        assert!(exit.is_ok());
        assert!(handle.is_closed());
        assert!(peer_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_reports_full() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = PumpHandle::new("n1".into(), 1, tx, CancellationToken::new());

        handle.try_enqueue(CommandEvent::new("a")).unwrap();
        assert_eq!(
            handle.try_enqueue(CommandEvent::new("b")),
            Err(EnqueueError::Full)
        );
    }
}
