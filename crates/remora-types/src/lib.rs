//! Core types for the Remora packet remoting protocol.
//!
//! This crate defines the data shared by every layer of the remoting stack:
//! packets and their routing identities, the error taxonomy, and the
//! connection/TLS configuration. It contains no I/O.

pub mod config;
pub mod error;
pub mod packet;

pub use error::{RemotingError, RemotingResult};
pub use packet::{CorrelationId, Direction, HandlerId, Packet};
