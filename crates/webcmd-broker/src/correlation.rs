//! Correlation of results to pending requests.
//!
//! Each pending request has one entry holding a single-use delivery slot
//! and a deadline timer. An entry is removed exactly once: either a result
//! with its id arrives first, or its deadline fires first. Whichever path
//! loses finds nothing to remove and is a no-op.

use std::{collections::HashMap, future::poll_fn};

use tokio::{sync::oneshot, time::Instant};
use tokio_util::time::{DelayQueue, delay_queue};
use webcmd_core::CommandResult;

use crate::error::CommandError;

type Outcome = Result<CommandResult, CommandError>;

/// Message on the broker's inbound queue.
#[derive(Debug)]
pub enum Inbound {
    /// Start tracking a request.
    Track(PendingRequest),
    /// A result arrived on a connection.
    Result { node: String, result: CommandResult },
    /// Dispatch could not route a request.
    Unroutable { id: String, reason: CommandError },
}

/// A request waiting for its result.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: String,
    pub deadline: Instant,
    pub slot: oneshot::Sender<Outcome>,
}

/// Caller side of a pending request.
///
/// Resolves exactly once: with the result, or with the reason no result
/// will come.
#[derive(Debug)]
pub struct ResultHandle {
    id: String,
    rx: oneshot::Receiver<Outcome>,
}

impl ResultHandle {
    pub(crate) fn new(id: String) -> (Self, oneshot::Sender<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { id, rx }, tx)
    }

    /// Request id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the result.
    ///
    /// # Errors
    /// Returns why the request closed without a result.
    pub async fn wait(self) -> Result<CommandResult, CommandError> {
        self.rx.await.unwrap_or(Err(CommandError::BrokerClosed))
    }
}

/// What happened to an arriving result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Matched a pending request and was handed to its caller.
    Delivered,
    /// Matched a pending request whose caller had gone away.
    CallerGone,
    /// No pending request has this id.
    Unknown,
}

#[derive(Debug)]
struct Entry {
    slot: oneshot::Sender<Outcome>,
    timer: delay_queue::Key,
    unroutable: Option<CommandError>,
}

/// Pending requests keyed by id, with their deadline timers.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<String, Entry>,
    timers: DelayQueue<String>,
}

impl CorrelationTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    #[cfg(test)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `id` is pending.
    #[cfg(test)]
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Start tracking a request. A duplicate id is refused on the new slot.
    pub fn track(&mut self, pending: PendingRequest) {
        let PendingRequest { id, deadline, slot } = pending;
        if self.entries.contains_key(&id) {
            tracing::warn!(%id, "Duplicate request id");
            let _ = slot.send(Err(CommandError::DuplicateId(id)));
            return;
        }
        let timer = self.timers.insert_at(id.clone(), deadline);
        self.entries.insert(
            id,
            Entry {
                slot,
                timer,
                unroutable: None,
            },
        );
    }

    /// Note that dispatch could not route `id`; reported when it expires.
    pub fn mark_unroutable(&mut self, id: &str, reason: CommandError) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.unroutable = Some(reason);
        }
    }

    /// Deliver a result to its pending request, if any.
    pub fn resolve(&mut self, result: CommandResult) -> Resolution {
        let Some(entry) = self.entries.remove(&result.id) else {
            tracing::warn!(id = %result.id, "Result for unknown or already resolved request, dropping");
            return Resolution::Unknown;
        };
        self.timers.remove(&entry.timer);
        let id = result.id.clone();
        if entry.slot.send(Ok(result)).is_err() {
            tracing::debug!(%id, "Caller gone before result arrived");
            return Resolution::CallerGone;
        }
        tracing::debug!(%id, "Result delivered");
        Resolution::Delivered
    }

    /// Close `id` without a result. Returns false if it was already resolved.
    fn expire(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        let reason = entry
            .unroutable
            .unwrap_or_else(|| CommandError::TimedOut(id.to_string()));
        tracing::debug!(%id, %reason, "Request expired");
        let _ = entry.slot.send(Err(reason));
        true
    }

    /// Wait for the next deadline and expire that request.
    ///
    /// Pends forever while nothing is tracked. Cancel safe.
    pub async fn expire_next(&mut self) -> String {
        loop {
            if let Some(expired) = poll_fn(|cx| self.timers.poll_expired(cx)).await {
                let id = expired.into_inner();
                if self.expire(&id) {
                    return id;
                }
            } else {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn track(table: &mut CorrelationTable, id: &str, timeout: Duration) -> ResultHandle {
        let (handle, slot) = ResultHandle::new(id.to_string());
        table.track(PendingRequest {
            id: id.to_string(),
            deadline: Instant::now() + timeout,
            slot,
        });
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_before_deadline() {
        let mut table = CorrelationTable::new();
        let handle = track(&mut table, "a", Duration::from_secs(10));

        assert_eq!(
            table.resolve(CommandResult::new("a", b"ok".to_vec())),
            Resolution::Delivered
        );
        assert!(table.is_empty());
        assert_eq!(handle.wait().await.unwrap().data, b"ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_before_result() {
        let mut table = CorrelationTable::new();
        let handle = track(&mut table, "a", Duration::from_secs(10));
        let start = Instant::now();

        assert_eq!(table.expire_next().await, "a");
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(handle.wait().await, Err(CommandError::TimedOut("a".into())));

        // Late result is dropped.
        assert_eq!(
            table.resolve(CommandResult::new("a", Vec::new())),
            Resolution::Unknown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unroutable_reported_at_deadline() {
        let mut table = CorrelationTable::new();
        let handle = track(&mut table, "g", Duration::from_secs(10));
        table.mark_unroutable("g", CommandError::NodeNotFound("ghost".into()));
        assert!(table.contains("g"));

        table.expire_next().await;
        assert_eq!(
            handle.wait().await,
            Err(CommandError::NodeNotFound("ghost".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlines_fire_in_order() {
        let mut table = CorrelationTable::new();
        let _slow = track(&mut table, "slow", Duration::from_secs(5));
        let _fast = track(&mut table, "fast", Duration::from_secs(1));

        assert_eq!(table.expire_next().await, "fast");
        assert_eq!(table.expire_next().await, "slow");
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_entry_timer_cancelled() {
        let mut table = CorrelationTable::new();
        let _a = track(&mut table, "a", Duration::from_secs(1));
        let _b = track(&mut table, "b", Duration::from_secs(2));
        table.resolve(CommandResult::new("a", Vec::new()));

        assert_eq!(table.expire_next().await, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_refused() {
        let mut table = CorrelationTable::new();
        let first = track(&mut table, "a", Duration::from_secs(10));
        let second = track(&mut table, "a", Duration::from_secs(10));

        assert_eq!(second.wait().await, Err(CommandError::DuplicateId("a".into())));
        table.resolve(CommandResult::new("a", b"1".to_vec()));
        assert_eq!(first.wait().await.unwrap().data, b"1");
    }

    #[tokio::test]
    async fn test_caller_gone() {
        let mut table = CorrelationTable::new();
        let handle = track(&mut table, "a", Duration::from_secs(10));
        drop(handle);
        assert_eq!(
            table.resolve(CommandResult::new("a", Vec::new())),
            Resolution::CallerGone
        );
    }

    #[tokio::test]
    async fn test_dropped_table_closes_handles() {
        let mut table = CorrelationTable::new();
        let handle = track(&mut table, "a", Duration::from_secs(10));
        drop(table);
        assert_eq!(handle.wait().await, Err(CommandError::BrokerClosed));
    }
}
