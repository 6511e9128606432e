//! The accepting side of a remoting connection.
//!
//! A [`PacketService`] binds a TCP listener, optionally wraps each accepted
//! stream in TLS, and feeds every inbound packet to its [`PacketDispatcher`]
//! together with a returner bound to the connection the packet arrived on.
//! Each accepted connection gets one read task which dispatches inline.

use crate::dispatcher::PacketDispatcher;
use crate::handler::PacketReturner;
use crate::transport::{FramedTransport, Transport, TransportReturner};
use dashmap::DashMap;
use remora_types::{Packet, RemotingResult};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Listens for remoting connections and dispatches their packets.
pub struct PacketService {
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    dispatcher: Arc<PacketDispatcher>,
    connections: Arc<DashMap<u64, Arc<FramedTransport>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl PacketService {
    /// Bind `addr` and start accepting connections.
    ///
    /// With `tls` set, every accepted stream must complete a TLS handshake
    /// before any packet is read from it.
    pub async fn start(
        addr: SocketAddr,
        dispatcher: Arc<PacketDispatcher>,
        tls: Option<Arc<ServerConfig>>,
    ) -> RemotingResult<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            tls = tls.is_some(),
            handlers = dispatcher.len(),
            "packet service listening"
        );

        let connections = Arc::new(DashMap::new());
        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&dispatcher),
            Arc::clone(&connections),
            tls.map(TlsAcceptor::from),
        ));

        Ok(Arc::new(Self {
            local_addr,
            dispatcher,
            connections,
            accept_task: Mutex::new(Some(accept_task)),
        }))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The handlers packets are dispatched to.
    pub fn dispatcher(&self) -> &Arc<PacketDispatcher> {
        &self.dispatcher
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting and close every open connection.
    pub async fn stop(&self) {
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        let open: Vec<Arc<FramedTransport>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for transport in &open {
            transport.close().await;
        }
        self.connections.clear();
        info!(addr = %self.local_addr, closed = open.len(), "packet service stopped");
    }

    async fn accept_loop(
        listener: TcpListener,
        dispatcher: Arc<PacketDispatcher>,
        connections: Arc<DashMap<u64, Arc<FramedTransport>>>,
        tls: Option<TlsAcceptor>,
    ) {
        let next_id = AtomicU64::new(0);
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "accepted connection");
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    let dispatcher = Arc::clone(&dispatcher);
                    let connections = Arc::clone(&connections);
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        Self::handle_inbound(id, stream, addr, tls, dispatcher, connections).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_inbound(
        id: u64,
        stream: TcpStream,
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        dispatcher: Arc<PacketDispatcher>,
        connections: Arc<DashMap<u64, Arc<FramedTransport>>>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %e, "failed to set TCP_NODELAY");
        }
        let peer = addr.to_string();
        let (transport, inbound) = match tls {
            None => FramedTransport::spawn(stream, peer),
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => FramedTransport::spawn(stream, peer),
                Err(e) => {
                    warn!(peer = %addr, error = %e, "TLS handshake failed");
                    return;
                }
            },
        };

        connections.insert(id, Arc::clone(&transport));
        Self::connection_loop(transport, inbound, &dispatcher).await;
        connections.remove(&id);
        debug!(peer = %addr, "connection ended");
    }

    async fn connection_loop(
        transport: Arc<FramedTransport>,
        mut inbound: mpsc::Receiver<Packet>,
        dispatcher: &PacketDispatcher,
    ) {
        let transport: Arc<dyn Transport> = transport;
        let returner: Arc<dyn PacketReturner> =
            Arc::new(TransportReturner::new(Arc::clone(&transport)));
        while let Some(packet) = inbound.recv().await {
            dispatcher.dispatch(packet, Arc::clone(&returner)).await;
        }
        transport.close().await;
    }
}

impl Drop for PacketService {
    fn drop(&mut self) {
        let task = self
            .accept_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}
