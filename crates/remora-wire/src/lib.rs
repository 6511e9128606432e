//! Packet remoting over TCP and TLS.
//!
//! Multiplexes one-way and correlated blocking sends over a single
//! full-duplex connection, and routes inbound packets to handlers by target.
//!
//! ## Architecture
//!
//! - **RemotingConnection**: client endpoint; one-way sends, blocking sends with
//!   per-call timeouts, teardown that unwinds every pending call
//! - **PacketDispatcher**: concurrent registry routing packets to handlers
//! - **PacketHandler / PacketReturner**: handler capability and the reply path
//! - **PacketService**: accepting endpoint dispatching inbound packets
//! - **TlsContextBuilder**: keystore/truststore loading and protocol sanitizing
//! - **message**: length-prefixed JSON frame codec

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod message;
mod pending;
pub mod service;
pub mod tls;
pub mod transport;

pub use config::{connector_from_config, load_config};
pub use connection::{ConnectionState, RemotingConnection};
pub use dispatcher::PacketDispatcher;
pub use handler::{EchoHandler, PacketHandler, PacketReturner};
pub use service::PacketService;
pub use tls::{BundledStores, TlsContext, TlsContextBuilder, TlsError};
pub use transport::{Connector, FramedTransport, TcpConnector, Transport};
