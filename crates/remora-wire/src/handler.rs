//! Packet handler and returner capabilities.
//!
//! A [`PacketHandler`] is registered in a [`PacketDispatcher`](crate::PacketDispatcher)
//! under a stable [`HandlerId`]. For every packet addressed to it, the handler
//! receives a [`PacketReturner`] bound to the channel the packet arrived on,
//! through which it may send a reply.
//!
//! Handlers run on the connection's read path. Anything slow should be moved
//! to a spawned task; the returner is an `Arc` so it can travel with it.

use async_trait::async_trait;
use remora_types::{HandlerId, Packet, RemotingResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sends packets back along the channel a request arrived on.
#[async_trait]
pub trait PacketReturner: Send + Sync + 'static {
    /// Write a packet to the originating channel.
    async fn send(&self, packet: Packet) -> RemotingResult<()>;

    /// Human-readable description of the remote end.
    fn peer(&self) -> String;
}

/// Reacts to inbound packets addressed to its identity.
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    /// Identity this handler is registered under.
    fn id(&self) -> HandlerId;

    /// Process one packet.
    async fn handle(&self, packet: Packet, returner: Arc<dyn PacketReturner>);
}

/// Answers every request with a copy of its own kind and payload.
///
/// Packets without a response target are consumed silently.
#[derive(Debug, Clone, Copy)]
pub struct EchoHandler {
    id: HandlerId,
}

impl EchoHandler {
    /// Create an echo handler with the given identity.
    pub fn new(id: impl Into<HandlerId>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl PacketHandler for EchoHandler {
    fn id(&self) -> HandlerId {
        self.id
    }

    async fn handle(&self, packet: Packet, returner: Arc<dyn PacketReturner>) {
        let Some(reply) = packet.echo() else {
            debug!(handler = %self.id, "one-way packet consumed");
            return;
        };
        if let Err(e) = returner.send(reply).await {
            warn!(handler = %self.id, peer = %returner.peer(), error = %e, "failed to send echo reply");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingReturner;
    use super::*;
    use remora_types::CorrelationId;

    #[tokio::test]
    async fn test_echo_replies_to_request() {
        let handler = EchoHandler::new(10);
        let returner = Arc::new(RecordingReturner::default());
        let request = Packet::new(4, "hi").routed(
            HandlerId(10),
            Some(HandlerId(10)),
            Some(CorrelationId(8)),
        );

        handler.handle(request, returner.clone()).await;

        let sent = returner.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target(), HandlerId(10));
        assert_eq!(sent[0].correlation_id(), Some(CorrelationId(8)));
        assert_eq!(sent[0].payload().as_ref(), b"hi");
    }

    #[tokio::test]
    async fn test_echo_ignores_one_way() {
        let handler = EchoHandler::new(10);
        let returner = Arc::new(RecordingReturner::default());
        let oneway = Packet::empty(4).routed(HandlerId(10), None, None);

        handler.handle(oneway, returner.clone()).await;

        assert!(returner.sent.lock().unwrap().is_empty());
    }
}
