//! WebSocket endpoint agents connect to.

use std::{net::SocketAddr, pin::Pin};

use axum::{
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use webcmd_broker::{BrokerHandle, TransportError};
use webcmd_core::node_identity_from_addr;

type FrameReader = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;
type FrameWriter = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// WebSocket upgrade handler.
///
/// The node identity comes from the peer address with its port stripped.
pub async fn events_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(broker): State<BrokerHandle>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, peer, broker))
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, broker: BrokerHandle) {
    let node = node_identity_from_addr(&peer);
    tracing::info!(%node, %peer, "Agent connected");

    let (reader, writer) = split_frames(socket);
    if let Err(e) = broker.attach(node.clone(), reader, writer).await {
        tracing::warn!(%node, "Rejected connection: {e}");
    }
}

/// Split a socket into a frame stream and a frame sink.
///
/// Text and binary frames carry payloads; control frames are skipped and a
/// close frame ends the stream.
fn split_frames(socket: WebSocket) -> (FrameReader, FrameWriter) {
    let (sender, receiver) = socket.split();

    let reader = receiver
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().as_bytes().to_vec())),
                Ok(Message::Binary(data)) => Some(Ok(data.to_vec())),
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Read(e.to_string()))),
            })
        });

    let writer = sender
        .with(|frame: String| future::ready(Ok::<_, axum::Error>(Message::Text(frame.into()))))
        .sink_map_err(|e| TransportError::Write(e.to_string()));

    (Box::pin(reader), Box::pin(writer))
}
