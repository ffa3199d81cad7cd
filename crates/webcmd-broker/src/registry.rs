//! Node registry.
//!
//! Maps node identities to their live pumps. Owned and mutated by the
//! broker's routing task only.

use std::collections::HashMap;

use webcmd_core::CommandEvent;

use crate::pump::{ConnId, EnqueueError, PumpHandle};

/// Outcome of dispatching one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Queued on this many pumps.
    Queued(usize),
    /// The target node has no registered pump.
    NodeNotFound,
    /// Broadcast with no registered pumps.
    NoNodes,
}

/// Node identity to pump mapping.
#[derive(Debug, Default)]
pub struct Registry {
    pumps: HashMap<String, PumpHandle>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a pump, returning the entry it superseded.
    ///
    /// The superseded pump keeps running until its own socket fails or it is
    /// cancelled; it just stops receiving new events.
    pub fn register(&mut self, pump: PumpHandle) -> Option<PumpHandle> {
        self.pumps.insert(pump.node().to_string(), pump)
    }

    /// Remove a node's entry. Idempotent.
    pub fn unregister(&mut self, node: &str) -> Option<PumpHandle> {
        self.pumps.remove(node)
    }

    /// Remove a node's entry only if it still belongs to connection `conn`.
    pub fn unregister_connection(&mut self, node: &str, conn: ConnId) -> bool {
        if self.pumps.get(node).is_some_and(|p| p.conn() == conn) {
            self.pumps.remove(node);
            true
        } else {
            false
        }
    }

    /// Look up a node's pump.
    #[cfg(test)]
    #[must_use]
    pub fn get(&self, node: &str) -> Option<&PumpHandle> {
        self.pumps.get(node)
    }

    /// Registered node identities, sorted.
    #[must_use]
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.pumps.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Number of registered nodes.
    #[cfg(test)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.pumps.len()
    }

    /// Whether no node is registered.
    #[cfg(test)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pumps.is_empty()
    }

    /// Queue an event on its target pump, or on every pump for a broadcast.
    ///
    /// Never waits: a pump whose queue is full or closing misses the event.
    pub fn dispatch(&self, event: &CommandEvent) -> Dispatch {
        if !event.is_broadcast() {
            let Some(pump) = self.pumps.get(&event.node) else {
                tracing::warn!(node = %event.node, id = %event.id, "No connection for node, dropping event");
                return Dispatch::NodeNotFound;
            };
            return Dispatch::Queued(usize::from(enqueue(pump, event.clone())));
        }

        if self.pumps.is_empty() {
            tracing::warn!(id = %event.id, "Broadcast with no connected nodes");
            return Dispatch::NoNodes;
        }
        let queued = self
            .pumps
            .values()
            .filter(|pump| enqueue(pump, event.clone()))
            .count();
        Dispatch::Queued(queued)
    }

    /// Cancel every pump and clear the table.
    pub fn cancel_all(&mut self) {
        for (_, pump) in self.pumps.drain() {
            pump.cancel();
        }
    }
}

fn enqueue(pump: &PumpHandle, event: CommandEvent) -> bool {
    let id = event.id.clone();
    match pump.try_enqueue(event) {
        Ok(()) => true,
        Err(EnqueueError::Full) => {
            tracing::warn!(node = pump.node(), %id, "Outbound queue full, dropping event");
            false
        }
        Err(EnqueueError::Closed) => {
            tracing::warn!(node = pump.node(), %id, "Connection closing, dropping event");
            false
        }
    }
}
