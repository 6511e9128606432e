//! Routing of inbound packets to registered handlers.
//!
//! The [`PacketDispatcher`] is a concurrent registry mapping [`HandlerId`]s to
//! handlers. Dispatch runs on a connection's read path while application code
//! registers and unregisters handlers from other tasks.
//!
//! Registering a second handler under an occupied identity is rejected with
//! [`RemotingError::DuplicateHandler`]; callers must `unregister` first.

use crate::handler::{PacketHandler, PacketReturner};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use remora_types::{HandlerId, Packet, RemotingError, RemotingResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Thread-safe registry of packet handlers.
#[derive(Default)]
pub struct PacketDispatcher {
    handlers: DashMap<HandlerId, Arc<dyn PacketHandler>>,
    /// Packets dropped because no handler was registered for their target.
    dropped: AtomicU64,
}

impl PacketDispatcher {
    /// Create a new empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own identity.
    pub fn register(&self, handler: Arc<dyn PacketHandler>) -> RemotingResult<()> {
        let id = handler.id();
        match self.handlers.entry(id) {
            Entry::Occupied(_) => Err(RemotingError::DuplicateHandler(id)),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                debug!(handler = %id, "handler registered");
                Ok(())
            }
        }
    }

    /// Remove the handler registered under `id`, if any.
    pub fn unregister(&self, id: HandlerId) -> Option<Arc<dyn PacketHandler>> {
        let removed = self.handlers.remove(&id).map(|(_, handler)| handler);
        if removed.is_some() {
            debug!(handler = %id, "handler unregistered");
        }
        removed
    }

    /// Route a packet to the handler registered for its target.
    ///
    /// A packet with no matching handler is dropped and counted.
    pub async fn dispatch(&self, packet: Packet, returner: Arc<dyn PacketReturner>) {
        let target = packet.target();
        // Clone the handler out so no shard lock is held across the await.
        let handler = self.handlers.get(&target).map(|entry| Arc::clone(entry.value()));
        match handler {
            Some(handler) => handler.handle(packet, returner).await,
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target_id = %target,
                    peer = %returner.peer(),
                    correlation = ?packet.correlation_id(),
                    "no handler registered for packet target, dropping"
                );
            }
        }
    }

    /// Whether a handler is registered under `id`.
    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Identities of all registered handlers, sorted.
    pub fn handler_ids(&self) -> Vec<HandlerId> {
        let mut ids: Vec<HandlerId> = self.handlers.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Number of packets dropped for lack of a handler.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PacketDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDispatcher")
            .field("handlers", &self.handler_ids())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}
