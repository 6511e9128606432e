//! One-way and correlated blocking sends over a transport.
//!
//! A [`RemotingConnection`] owns one transport, the table of in-flight blocking
//! calls, and a dispatcher for packets the peer pushes unsolicited. A single
//! inbound task reads the transport: replies resolve their pending call,
//! everything else is dispatched by target.
//!
//! ```text
//!  caller ──send_blocking──► PendingCalls::register ──► Transport::write
//!                                                          │
//!  caller ◄── oneshot ◄── PendingCalls::complete ◄── inbound task ◄── peer
//! ```
//!
//! Lifecycle is `Created → Started → Stopped`. Stopping (explicitly, or because
//! the transport closed) fails every pending call with
//! [`RemotingError::ConnectionClosed`].

use crate::dispatcher::PacketDispatcher;
use crate::handler::PacketReturner;
use crate::pending::{PendingCalls, PendingGuard, Registration};
use crate::transport::{Connector, Transport, TransportReturner};
use remora_types::config::ConnectionParams;
use remora_types::{HandlerId, Packet, RemotingError, RemotingResult};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a [`RemotingConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, not yet connected.
    Created,
    /// Connected; sends are accepted.
    Started,
    /// Stopped. Terminal.
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Created => write!(f, "created"),
            ConnectionState::Started => write!(f, "started"),
            ConnectionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// State shared between the connection handle and its inbound task.
struct Shared {
    pending: PendingCalls,
    dispatcher: Arc<PacketDispatcher>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    state: Mutex<ConnectionState>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The transport, if the connection is started.
    fn started_transport(&self) -> RemotingResult<Arc<dyn Transport>> {
        if self.state() != ConnectionState::Started {
            return Err(RemotingError::ConnectionClosed);
        }
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(RemotingError::ConnectionClosed)
    }

    /// Move to `Stopped`, fail all pending calls and close the transport.
    ///
    /// Returns `false` if the connection was already stopped.
    async fn shutdown(&self, reason: &str) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == ConnectionState::Stopped {
                return false;
            }
            *state = ConnectionState::Stopped;
        }

        let failed = self.pending.fail_all();
        let transport = self
            .transport
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let peer = transport.as_ref().map(|t| t.peer());
        if let Some(transport) = transport {
            transport.close().await;
        }
        info!(peer = ?peer, failed_calls = failed, reason, "connection stopped");
        true
    }

    /// Inbound path: resolve replies, dispatch everything else.
    async fn inbound_loop(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        mut inbound: mpsc::Receiver<Packet>,
    ) {
        let returner: Arc<dyn PacketReturner> = Arc::new(TransportReturner::new(transport));

        while let Some(packet) = inbound.recv().await {
            let packet = match self.pending.complete(packet) {
                Ok(()) => continue,
                Err(packet) => packet,
            };
            // A correlated response nobody waits for belongs to a call that
            // timed out or was abandoned. Requests go to the dispatcher.
            if let Some(correlation) = packet.correlation_id().filter(|_| packet.is_response()) {
                warn!(
                    correlation = %correlation,
                    peer = %returner.peer(),
                    "reply matches no pending call, dropping"
                );
                continue;
            }
            self.dispatcher.dispatch(packet, Arc::clone(&returner)).await;
        }

        if self.shutdown("transport closed").await {
            debug!("inbound task observed transport close");
        }
    }
}

/// A client connection multiplexing one-way and blocking sends.
pub struct RemotingConnection {
    connector: Arc<dyn Connector>,
    params: ConnectionParams,
    shared: Arc<Shared>,
    /// Serializes `start` and `stop`.
    lifecycle: tokio::sync::Mutex<()>,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

impl RemotingConnection {
    /// Create a connection that will connect through `connector` on `start`.
    pub fn new(connector: Arc<dyn Connector>, params: ConnectionParams) -> Self {
        Self {
            connector,
            params,
            shared: Arc::new(Shared {
                pending: PendingCalls::new(),
                dispatcher: Arc::new(PacketDispatcher::new()),
                transport: RwLock::new(None),
                state: Mutex::new(ConnectionState::Created),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            inbound_task: Mutex::new(None),
        }
    }

    /// Connect and start the inbound task.
    ///
    /// Only valid in the `Created` state. A failed connect leaves the
    /// connection in `Created` so it may be retried.
    pub async fn start(&self) -> RemotingResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.shared.state();
        if current != ConnectionState::Created {
            return Err(RemotingError::InvalidState {
                current: current.to_string(),
                operation: "start".to_string(),
            });
        }

        let (transport, inbound) = self.connector.connect().await?;
        let peer = transport.peer();
        *self
            .shared
            .transport
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&transport));
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionState::Started;

        let task = tokio::spawn(Arc::clone(&self.shared).inbound_loop(transport, inbound));
        *self.inbound_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        info!(
            peer = %peer,
            timeout_ms = self.params.timeout_ms,
            "connection started"
        );
        Ok(())
    }

    /// Stop the connection. Idempotent.
    ///
    /// Every pending blocking call fails with [`RemotingError::ConnectionClosed`].
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.shared.shutdown("stopped by caller").await;
        // The inbound task ends on its own once the transport is closed.
        let task = self
            .inbound_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(error = %e, "inbound task panicked");
                }
            }
        }
    }

    /// Send a packet without waiting for any reply.
    ///
    /// Returns once the transport accepted the write. No pending entry is
    /// created, so a reply the peer sends anyway is dispatched by target.
    pub async fn send_one_way(
        &self,
        target: HandlerId,
        response_target: Option<HandlerId>,
        packet: Packet,
    ) -> RemotingResult<()> {
        let transport = self.shared.started_transport()?;
        let packet = packet.routed(target, response_target, None);
        transport.write(&packet).await.map_err(write_failed)?;
        debug!(target_id = %target, kind = packet.kind(), "one-way packet sent");
        Ok(())
    }

    /// Send a request and wait for its reply, using the configured default timeout.
    pub async fn send_blocking(
        &self,
        target: HandlerId,
        response_target: HandlerId,
        packet: Packet,
    ) -> RemotingResult<Packet> {
        self.send_blocking_with_timeout(target, response_target, packet, self.params.timeout())
            .await
    }

    /// Send a request and wait up to `timeout` for its reply.
    pub async fn send_blocking_with_timeout(
        &self,
        target: HandlerId,
        response_target: HandlerId,
        packet: Packet,
        timeout: Duration,
    ) -> RemotingResult<Packet> {
        let transport = self.shared.started_transport()?;
        let Registration {
            correlation_id,
            deadline,
            mut reply,
        } = self.shared.pending.register(timeout, response_target);
        // Removes the entry on every early return, and when the caller drops
        // this future before it resolves.
        let mut guard = PendingGuard::new(&self.shared.pending, correlation_id);

        // A stop racing with registration may have drained the table already.
        if self.shared.state() != ConnectionState::Started {
            return Err(RemotingError::ConnectionClosed);
        }

        let packet = packet.routed(target, Some(response_target), Some(correlation_id));
        transport.write(&packet).await.map_err(write_failed)?;
        debug!(target_id = %target, correlation = %correlation_id, "blocking packet sent");

        match tokio::time::timeout_at(deadline, &mut reply).await {
            Ok(resolved) => {
                guard.disarm();
                resolved.unwrap_or(Err(RemotingError::ConnectionClosed))
            }
            Err(_) => {
                if self.shared.pending.cancel(correlation_id) {
                    debug!(correlation = %correlation_id, ?timeout, "blocking call timed out");
                    return Err(RemotingError::CallTimeout {
                        correlation_id,
                        timeout,
                    });
                }
                // Resolved between the timer firing and the cancel.
                match reply.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(RemotingError::ConnectionClosed),
                }
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Number of blocking calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Handlers for packets the peer sends without being asked.
    pub fn dispatcher(&self) -> &Arc<PacketDispatcher> {
        &self.shared.dispatcher
    }

    /// The remote end, while connected.
    pub fn peer(&self) -> Option<String> {
        self.shared
            .transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| t.peer())
    }

    /// Connection parameters.
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }
}

/// A transport closed underneath a started connection rejects the write.
fn write_failed(e: RemotingError) -> RemotingError {
    match e {
        RemotingError::ConnectionClosed => {
            RemotingError::Transmission("transport closed during write".to_string())
        }
        other => other,
    }
}

impl fmt::Debug for RemotingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotingConnection")
            .field("state", &self.state())
            .field("peer", &self.peer())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}
