//! Packets and routing identities.
//!
//! A [`Packet`] is an immutable, addressed unit of data. Routing fields are
//! stamped by building a new packet with [`Packet::routed`]; replies are built
//! with [`Packet::reply`], which carries the request's correlation ID back to
//! the handler named by its response target.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a packet handler within a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for HandlerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifier matching a reply to the blocking call waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether a packet starts an exchange or answers one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// One-way or request packet.
    #[default]
    Request,
    /// Built by [`Packet::reply`].
    Response,
}

/// An addressed unit of data exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default)]
    direction: Direction,
    target: HandlerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_target: Option<HandlerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<CorrelationId>,
    #[serde(default)]
    kind: u8,
    #[serde(default, with = "payload_base64")]
    payload: Bytes,
}

impl Packet {
    /// Create an unrouted packet. Routing is stamped when the packet is sent.
    pub fn new(kind: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            direction: Direction::Request,
            target: HandlerId(0),
            response_target: None,
            correlation_id: None,
            kind,
            payload: payload.into(),
        }
    }

    /// Create an unrouted packet with no payload.
    pub fn empty(kind: u8) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// Return a copy of this packet carrying the given routing fields.
    pub fn routed(
        self,
        target: HandlerId,
        response_target: Option<HandlerId>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            target,
            response_target,
            correlation_id,
            ..self
        }
    }

    /// Build a reply to this packet.
    ///
    /// The reply targets this packet's response target and carries its
    /// correlation ID. Returns `None` when the sender expects no reply.
    pub fn reply(&self, kind: u8, payload: impl Into<Bytes>) -> Option<Packet> {
        let target = self.response_target?;
        Some(Packet {
            direction: Direction::Response,
            target,
            response_target: None,
            correlation_id: self.correlation_id,
            kind,
            payload: payload.into(),
        })
    }

    /// Build a reply carrying this packet's own kind and payload.
    pub fn echo(&self) -> Option<Packet> {
        self.reply(self.kind, self.payload.clone())
    }

    /// Request or response.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether this packet answers an earlier request.
    pub fn is_response(&self) -> bool {
        self.direction == Direction::Response
    }

    /// Handler that must process this packet on arrival.
    pub fn target(&self) -> HandlerId {
        self.target
    }

    /// Handler on the sender's side that should receive any reply.
    pub fn response_target(&self) -> Option<HandlerId> {
        self.response_target
    }

    /// Whether the sender expects a reply.
    pub fn expects_reply(&self) -> bool {
        self.response_target.is_some()
    }

    /// Correlation ID, set only on packets belonging to a blocking exchange.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    /// Application-defined type code.
    pub fn kind(&self) -> u8 {
        self.kind
    }

    /// Opaque payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
