//! Serving one broker connection.
//!
//! The inbound loop decodes events and spawns one task per accepted event.
//! Every task hands its result to a single outbound loop, the only writer of
//! the socket. Either loop ending cancels the other.

use std::{sync::Arc, time::Duration};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use webcmd_core::{CommandEvent, CommandExecutor, CommandResult, protocol};

use crate::error::AgentError;

/// Serve one connection until it fails or `cancel` fires.
///
/// Commands still executing when the connection ends are aborted; their
/// callers will see the broker-side deadline instead.
///
/// # Errors
/// Returns the error that ended the connection.
pub async fn serve_connection<R, W>(
    reader: R,
    writer: W,
    executor: Arc<dyn CommandExecutor>,
    cancel: &CancellationToken,
    queue_capacity: usize,
    close_grace: Duration,
) -> Result<(), AgentError>
where
    R: Stream<Item = Result<Vec<u8>, AgentError>> + Unpin,
    W: Sink<String, Error = AgentError> + Unpin,
{
    let cancel = cancel.child_token();
    let (results_tx, results_rx) = mpsc::channel(queue_capacity.max(1));

    let (read_result, write_result) = tokio::join!(
        inbound_loop(reader, executor, results_tx, &cancel),
        outbound_loop(writer, results_rx, &cancel, close_grace),
    );
    read_result.and(write_result)
}

async fn inbound_loop<R>(
    mut reader: R,
    executor: Arc<dyn CommandExecutor>,
    results: mpsc::Sender<CommandResult>,
    cancel: &CancellationToken,
) -> Result<(), AgentError>
where
    R: Stream<Item = Result<Vec<u8>, AgentError>> + Unpin,
{
    let mut running = JoinSet::new();

    let outcome = loop {
        tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("Command task failed: {e}");
                }
            }
            frame = reader.next() => {
                let bytes = match frame {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => break Err(e),
                    None => break Err(AgentError::ConnectionClosed),
                };
                let event: CommandEvent = match protocol::decode(&bytes) {
                    Ok(event) => event,
                    Err(e) => break Err(e.into()),
                };
                tracing::debug!(id = %event.id, cmd = %event.cmd, "Event received");

                if event.is_expired() {
                    tracing::warn!(id = %event.id, "Event expired before execution, discarding");
                    continue;
                }
                running.spawn(execute(event, Arc::clone(&executor), results.clone()));
            }
        }
    };

    cancel.cancel();
    running.shutdown().await;
    outcome
}

async fn execute(
    event: CommandEvent,
    executor: Arc<dyn CommandExecutor>,
    results: mpsc::Sender<CommandResult>,
) {
    let data = match executor.execute(&event.cmd, &event.args).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(id = %event.id, cmd = %event.cmd, "Command failed: {e}");
            e.to_string().into_bytes()
        }
    };

    if event.is_expired() {
        tracing::warn!(id = %event.id, "Event expired during execution, discarding result");
        return;
    }
    if results.send(CommandResult::new(event.id, data)).await.is_err() {
        tracing::debug!("Connection gone, result dropped");
    }
}

async fn outbound_loop<W>(
    mut writer: W,
    mut results: mpsc::Receiver<CommandResult>,
    cancel: &CancellationToken,
    close_grace: Duration,
) -> Result<(), AgentError>
where
    W: Sink<String, Error = AgentError> + Unpin,
{
    let outcome = loop {
        let result = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            result = results.recv() => result,
        };
        let Some(result) = result else {
            break Ok(());
        };

        let frame = match protocol::encode(&result) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(id = %result.id, "Failed to encode result: {e}");
                continue;
            }
        };
        let sent = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            sent = writer.send(frame) => sent,
        };
        if let Err(e) = sent {
            break Err(e);
        }
        tracing::debug!(id = %result.id, "Result sent");
    };

    cancel.cancel();
    if tokio::time::timeout(close_grace, writer.close()).await.is_err() {
        tracing::debug!("Close timed out");
    }
    outcome
}
