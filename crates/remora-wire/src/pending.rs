//! In-flight blocking calls, keyed by correlation ID.
//!
//! Each entry owns the sending half of a `oneshot` channel, so a call is
//! resolved exactly once by whichever comes first: the matching reply,
//! the caller's timeout, or connection teardown. A caller that goes away
//! early removes its entry through the [`PendingGuard`] it holds.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use remora_types::{CorrelationId, HandlerId, Packet, RemotingError, RemotingResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Receiving half handed to the waiting caller.
pub(crate) type PendingReply = oneshot::Receiver<RemotingResult<Packet>>;

struct PendingCall {
    reply_tx: oneshot::Sender<RemotingResult<Packet>>,
    /// Handler the reply is addressed to on this side.
    response_target: HandlerId,
}

/// A freshly registered call.
pub(crate) struct Registration {
    pub(crate) correlation_id: CorrelationId,
    pub(crate) deadline: Instant,
    pub(crate) reply: PendingReply,
}

/// Concurrent map of outstanding blocking calls.
pub(crate) struct PendingCalls {
    calls: DashMap<CorrelationId, PendingCall>,
    next_id: AtomicU64,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            calls: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a correlation ID not currently in flight and register a call
    /// whose reply is addressed to `response_target`.
    pub(crate) fn register(&self, timeout: Duration, response_target: HandlerId) -> Registration {
        let deadline = Instant::now() + timeout;
        loop {
            let id = CorrelationId(self.next_id.fetch_add(1, Ordering::Relaxed));
            if let Entry::Vacant(slot) = self.calls.entry(id) {
                let (reply_tx, reply) = oneshot::channel();
                slot.insert(PendingCall {
                    reply_tx,
                    response_target,
                });
                return Registration {
                    correlation_id: id,
                    deadline,
                    reply,
                };
            }
        }
    }

    /// Resolve the call matching the packet's correlation ID.
    ///
    /// A response packet matches on its ID alone. A request-shaped packet
    /// (a peer that re-sends the request retargeted) matches only when it is
    /// addressed to the call's response target, since the peer's own
    /// requests may reuse the ID. Hands the packet back when nothing matches.
    pub(crate) fn complete(&self, packet: Packet) -> Result<(), Packet> {
        let Some(id) = packet.correlation_id() else {
            return Err(packet);
        };
        let matched = self.calls.remove_if(&id, |_, call| {
            packet.is_response() || packet.target() == call.response_target
        });
        let Some((_, call)) = matched else {
            return Err(packet);
        };
        if call.reply_tx.send(Ok(packet)).is_err() {
            debug!(correlation = %id, "caller gave up before the reply arrived");
        }
        Ok(())
    }

    /// Remove a call without resolving it. Returns whether it was still pending.
    pub(crate) fn cancel(&self, id: CorrelationId) -> bool {
        self.calls.remove(&id).is_some()
    }

    /// Fail every outstanding call with [`RemotingError::ConnectionClosed`].
    ///
    /// Returns how many calls were failed; the map is empty afterwards.
    pub(crate) fn fail_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                let _ = call.reply_tx.send(Err(RemotingError::ConnectionClosed));
                failed += 1;
            }
        }
        failed
    }

    /// Number of outstanding calls.
    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Removes a call's entry when dropped, unless disarmed.
///
/// Held by the waiting caller so that abandoning the call (dropping its
/// future) never leaves a dead entry behind.
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: CorrelationId,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(pending: &'a PendingCalls, id: CorrelationId) -> Self {
        Self {
            pending,
            id,
            armed: true,
        }
    }

    /// The entry is gone already; nothing to clean up.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.pending.cancel(self.id) {
            debug!(correlation = %self.id, "blocking call abandoned");
        }
    }
}
