//! Framed packet channels over byte streams.
//!
//! A [`Transport`] is the write side of a connection. Its read side is a
//! spawned task that decodes frames and forwards packets into an
//! `mpsc::Receiver<Packet>`; the receiver yielding `None` means the transport
//! has closed. [`Connector`]s produce a transport together with that receiver.
//!
//! Frames are written by a dedicated writer task that owns the write half.
//! Callers hand it encoded frames and wait for an acknowledgement, so a
//! caller that is cancelled mid-write never leaves a partial frame behind.

use crate::handler::PacketReturner;
use crate::message::{encode_packet, read_packet};
use crate::tls::TlsContext;
use async_trait::async_trait;
use remora_types::{Packet, RemotingError, RemotingResult};
use rustls_pki_types::ServerName;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Capacity of the inbound packet channel of a framed transport.
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the outbound frame queue of a framed transport.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 1024;

/// How long `close` waits for queued frames to be flushed.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Write side of a packet connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one packet. Each write is atomic with respect to other writes.
    async fn write(&self, packet: &Packet) -> RemotingResult<()>;

    /// Close the transport. Idempotent.
    async fn close(&self);

    /// Human-readable description of the remote end.
    fn peer(&self) -> String;
}

/// Establishes transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a transport and return it with its inbound packet stream.
    async fn connect(&self) -> RemotingResult<(Arc<dyn Transport>, mpsc::Receiver<Packet>)>;
}

/// An encoded frame and the slot its write result is reported to.
struct OutboundFrame {
    bytes: Vec<u8>,
    written: oneshot::Sender<RemotingResult<()>>,
}

/// A transport framing packets over any async byte stream.
pub struct FramedTransport {
    peer: String,
    /// `None` once closed.
    frames: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    writer_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl FramedTransport {
    /// Split `stream`, spawn its reader and writer tasks and return the
    /// transport with its inbound packet stream.
    pub fn spawn<S>(stream: S, peer: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<Packet>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let (reader, writer) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

        let reader_task = tokio::spawn(read_loop(reader, inbound_tx, peer.clone()));
        let writer_task = tokio::spawn(write_loop(writer, frames_rx, peer.clone()));

        let transport = Arc::new(Self {
            peer,
            frames: Mutex::new(Some(frames_tx)),
            writer_task: tokio::sync::Mutex::new(Some(writer_task)),
            reader_task: Mutex::new(Some(reader_task)),
        });
        (transport, inbound_rx)
    }

    /// Whether [`Transport::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

async fn read_loop<R>(mut reader: R, inbound: mpsc::Sender<Packet>, peer: String)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_packet(&mut reader).await {
            Ok(packet) => {
                if inbound.send(packet).await.is_err() {
                    debug!(peer = %peer, "inbound receiver dropped, stopping reader");
                    return;
                }
            }
            Err(RemotingError::ConnectionClosed) => {
                debug!(peer = %peer, "peer closed the connection");
                return;
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "read loop ended");
                return;
            }
        }
    }
}

/// Write queued frames in order, each in full. Ends when the queue closes
/// or a write fails; the stream is shut down either way.
async fn write_loop<W>(mut writer: W, mut frames: mpsc::Receiver<OutboundFrame>, peer: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let result = match writer.write_all(&frame.bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        let failed = result.is_err();
        if let Err(e) = &result {
            debug!(peer = %peer, error = %e, "write failed, stopping writer");
        }
        let _ = frame
            .written
            .send(result.map_err(|e| RemotingError::Transmission(e.to_string())));
        if failed {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[async_trait]
impl Transport for FramedTransport {
    async fn write(&self, packet: &Packet) -> RemotingResult<()> {
        let bytes = encode_packet(packet)?;
        let frames = self
            .frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(RemotingError::ConnectionClosed)?;

        let (written, result) = oneshot::channel();
        frames
            .send(OutboundFrame { bytes, written })
            .await
            .map_err(|_| RemotingError::Transmission("writer stopped".to_string()))?;
        // Once queued, the frame is written in full even if this future is dropped.
        result
            .await
            .map_err(|_| RemotingError::Transmission("writer stopped".to_string()))?
    }

    async fn close(&self) {
        let frames = self
            .frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if frames.is_none() {
            return;
        }
        drop(frames);

        let writer_task = self.writer_task.lock().await.take();
        if let Some(mut task) = writer_task {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                debug!(peer = %self.peer, "queued frames not flushed in time, aborting writer");
                task.abort();
            }
        }
        let reader_task = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = reader_task {
            task.abort();
        }
        debug!(peer = %self.peer, "transport closed");
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Returner bound to the transport a packet arrived on.
#[derive(Clone)]
pub struct TransportReturner {
    transport: Arc<dyn Transport>,
}

impl TransportReturner {
    /// Bind a returner to `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl PacketReturner for TransportReturner {
    async fn send(&self, packet: Packet) -> RemotingResult<()> {
        self.transport.write(&packet).await
    }

    fn peer(&self) -> String {
        self.transport.peer()
    }
}

/// TLS settings applied by a [`TcpConnector`].
#[derive(Clone)]
struct ClientTls {
    context: Arc<TlsContext>,
    server_name: String,
    requested_protocols: Vec<String>,
}

/// Connects over TCP, optionally wrapping the stream in TLS.
#[derive(Clone)]
pub struct TcpConnector {
    address: String,
    tls: Option<ClientTls>,
}

impl TcpConnector {
    /// Plain TCP connector for `host:port`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls: None,
        }
    }

    /// Wrap connections in TLS using `context`, verifying the server against
    /// `server_name` and offering `requested_protocols` (empty for defaults).
    pub fn with_tls(
        mut self,
        context: Arc<TlsContext>,
        server_name: impl Into<String>,
        requested_protocols: Vec<String>,
    ) -> Self {
        self.tls = Some(ClientTls {
            context,
            server_name: server_name.into(),
            requested_protocols,
        });
        self
    }

    /// Target address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> RemotingResult<(Arc<dyn Transport>, mpsc::Receiver<Packet>)> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| self.address.clone());

        match &self.tls {
            None => {
                info!(peer = %peer, "connected");
                let (transport, inbound) = FramedTransport::spawn(stream, peer);
                let transport: Arc<dyn Transport> = transport;
                Ok((transport, inbound))
            }
            Some(tls) => {
                let config = tls.context.client_config(&tls.requested_protocols)?;
                let server_name = ServerName::try_from(tls.server_name.clone())
                    .map_err(|e| RemotingError::Tls(format!("invalid server name: {e}")))?;
                let stream = TlsConnector::from(config)
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| RemotingError::Tls(format!("handshake with {peer} failed: {e}")))?;
                info!(peer = %peer, "connected (TLS)");
                let (transport, inbound) = FramedTransport::spawn(stream, peer);
                let transport: Arc<dyn Transport> = transport;
                Ok((transport, inbound))
            }
        }
    }
}
