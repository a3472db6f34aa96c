//! payload.rs - typed message payloads and the packet header.
//!
//! Every payload schema is protobuf (proto3) encoded with prost. The header
//! selects a concrete payload schema through its `id` field; `Payload` is
//! the tagged union with the single decode entry point.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prost::Message;
use prost_types::Timestamp;
use thiserror::Error;

use super::packet::{Packet, PacketError};
use super::{MessageKind, ENCODING_PROTOBUF, MODULE_HEADER, MODULE_PAYLOAD, SKEW_WINDOW, VERSION};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol: missing module [{0}]")]
    MissingModule(String),
    #[error("protocol: module [{0}] present but not listed in header")]
    UnlistedModule(String),
    #[error("protocol: version mismatch: got [{0}], want [{VERSION}]")]
    VersionMismatch(String),
    #[error("protocol: sent_at outside skew window")]
    ClockSkew,
    #[error("protocol: unknown message id: {0}")]
    UnknownMessage(i32),
    #[error("protocol: decode: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

// --- Schemas ---

/// Packet header, always present as module `HE`. Its `modules` field must
/// list every other module carried by the packet.
#[derive(Clone, PartialEq, Message)]
pub struct Header {
    #[prost(int32, tag = "1")]
    pub id: i32,
    #[prost(string, repeated, tag = "2")]
    pub modules: Vec<String>,
    #[prost(message, optional, tag = "3")]
    pub sent_at: Option<Timestamp>,
    #[prost(string, tag = "4")]
    pub protocol_version: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PayloadHello {
    #[prost(string, tag = "1")]
    pub bport: String,
    #[prost(string, tag = "2")]
    pub pport: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PayloadConnect {
    /// Canonical `host:port` of the booster listener to wire with.
    #[prost(string, tag = "1")]
    pub target: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PayloadDisconnect {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PayloadHeartbeat {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(int32, tag = "2")]
    pub hops: i32,
    #[prost(message, optional, tag = "3")]
    pub ttl: Option<Timestamp>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TunnelInfo {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub target: String,
    #[prost(uint32, tag = "3")]
    pub copies: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PayloadNode {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub baddr: String,
    #[prost(string, tag = "3")]
    pub paddr: String,
    #[prost(bool, tag = "4")]
    pub active: bool,
    #[prost(message, repeated, tag = "5")]
    pub tunnels: Vec<TunnelInfo>,
}

/// A tunnel lifecycle event. `node_id` names the node the tunnel belongs
/// to, which is also the event's originator; `(node_id, seq)` keys the
/// visited-set that suppresses propagation loops.
#[derive(Clone, PartialEq, Message)]
pub struct PayloadProxyUpdate {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(string, tag = "2")]
    pub target: String,
    #[prost(int32, tag = "3")]
    pub operation: i32,
    #[prost(uint64, tag = "4")]
    pub seq: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PayloadBandwidth {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(int64, tag = "2")]
    pub tot: i64,
    #[prost(int64, tag = "3")]
    pub bandwidth: i64,
    /// Either "download" or "upload".
    #[prost(string, tag = "4")]
    pub kind: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PayloadMonitor {
    #[prost(int32, tag = "1")]
    pub feature: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PayloadInspect {
    #[prost(message, repeated, tag = "1")]
    pub features: Vec<PayloadMonitor>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PayloadCtrl {
    #[prost(int32, tag = "1")]
    pub operation: i32,
}

/// Tunnel operations carried by `PayloadProxyUpdate.operation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TunnelOp {
    Open = 0,
    Close = 1,
    Ack = 2,
}

impl TunnelOp {
    pub fn from_id(id: i32) -> Option<TunnelOp> {
        match id {
            0 => Some(TunnelOp::Open),
            1 => Some(TunnelOp::Close),
            2 => Some(TunnelOp::Ack),
            _ => None,
        }
    }
}

/// Control operations carried by `PayloadCtrl.operation`.
pub const CTRL_RESTART: i32 = 1;

// --- Tagged union ---

/// The decoded payload of a validated packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Hello(PayloadHello),
    Connect(PayloadConnect),
    Disconnect(PayloadDisconnect),
    Heartbeat(PayloadHeartbeat),
    Notify,
    Inspect(PayloadInspect),
    TunnelEvent(PayloadProxyUpdate),
    Node(PayloadNode),
    Bandwidth(PayloadBandwidth),
    Ctrl(PayloadCtrl),
}

impl Payload {
    /// Decodes the raw payload bytes of a packet whose header carries
    /// `kind`. `Notify` carries no payload module; every other kind does.
    pub fn decode(kind: MessageKind, raw: &[u8]) -> Result<Payload, ProtocolError> {
        Ok(match kind {
            MessageKind::Hello => Payload::Hello(PayloadHello::decode(raw)?),
            MessageKind::Connect => Payload::Connect(PayloadConnect::decode(raw)?),
            MessageKind::Disconnect => Payload::Disconnect(PayloadDisconnect::decode(raw)?),
            MessageKind::Heartbeat => Payload::Heartbeat(PayloadHeartbeat::decode(raw)?),
            MessageKind::Notify => Payload::Notify,
            MessageKind::Inspect => Payload::Inspect(PayloadInspect::decode(raw)?),
            MessageKind::TunnelEvent => Payload::TunnelEvent(PayloadProxyUpdate::decode(raw)?),
            MessageKind::Node => Payload::Node(PayloadNode::decode(raw)?),
            MessageKind::Bandwidth => Payload::Bandwidth(PayloadBandwidth::decode(raw)?),
            MessageKind::Ctrl => Payload::Ctrl(PayloadCtrl::decode(raw)?),
        })
    }

    /// Extracts and decodes the payload of a validated packet.
    pub fn from_packet(kind: MessageKind, p: &Packet) -> Result<Payload, ProtocolError> {
        if kind == MessageKind::Notify {
            return Ok(Payload::Notify);
        }
        let m = p
            .module(MODULE_PAYLOAD)
            .ok_or_else(|| ProtocolError::MissingModule(MODULE_PAYLOAD.to_string()))?;
        Payload::decode(kind, m.payload())
    }
}

// --- Composition ---

pub fn timestamp_now() -> Timestamp {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    Timestamp {
        seconds: now.as_secs() as i64,
        nanos: now.subsec_nanos() as i32,
    }
}

pub fn timestamp_in(d: Duration) -> Timestamp {
    let at = SystemTime::now() + d;
    let since = at.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    Timestamp {
        seconds: since.as_secs() as i64,
        nanos: since.subsec_nanos() as i32,
    }
}

pub fn timestamp_to_system(ts: &Timestamp) -> SystemTime {
    let mut t = UNIX_EPOCH;
    if ts.seconds >= 0 {
        t += Duration::from_secs(ts.seconds as u64);
    }
    if ts.nanos > 0 {
        t += Duration::from_nanos(ts.nanos as u64);
    }
    t
}

/// Builds a packet of the given kind with an optional payload module.
pub fn compose<M: Message>(kind: MessageKind, pl: Option<&M>) -> Result<Packet, ProtocolError> {
    let mut modules = Vec::new();
    if pl.is_some() {
        modules.push(MODULE_PAYLOAD.to_string());
    }

    let header = Header {
        id: kind.id(),
        modules,
        sent_at: Some(timestamp_now()),
        protocol_version: VERSION.to_string(),
    };

    let mut p = Packet::new();
    p.add_module(MODULE_HEADER, header.encode_to_vec(), ENCODING_PROTOBUF)?;
    if let Some(pl) = pl {
        p.add_module(MODULE_PAYLOAD, pl.encode_to_vec(), ENCODING_PROTOBUF)?;
    }
    Ok(p)
}

/// Builds a packet that carries only a header, for kinds without a body.
pub fn compose_bare(kind: MessageKind) -> Result<Packet, ProtocolError> {
    compose::<PayloadHello>(kind, None)
}

/// Decodes the header module without validating the rest of the packet.
pub fn extract_header(p: &Packet) -> Result<Header, ProtocolError> {
    let m = p
        .module(MODULE_HEADER)
        .ok_or_else(|| ProtocolError::MissingModule(MODULE_HEADER.to_string()))?;
    Ok(Header::decode(m.payload())?)
}

/// Validates a packet: known message kind, matching protocol version,
/// `sent_at` within the skew window, and module lists consistent in both
/// directions. Returns the header's message kind on success.
pub fn validate(p: &Packet) -> Result<(MessageKind, Header), ProtocolError> {
    let h = extract_header(p)?;

    let kind =
        MessageKind::from_id(h.id).ok_or(ProtocolError::UnknownMessage(h.id))?;

    if h.protocol_version != VERSION {
        return Err(ProtocolError::VersionMismatch(h.protocol_version));
    }

    if let Some(ts) = &h.sent_at {
        let sent = timestamp_to_system(ts);
        let now = SystemTime::now();
        let skew = match now.duration_since(sent) {
            Ok(d) => d,
            Err(e) => e.duration(),
        };
        if skew > SKEW_WINDOW {
            return Err(ProtocolError::ClockSkew);
        }
    } else {
        return Err(ProtocolError::ClockSkew);
    }

    // every listed module must be present
    for id in &h.modules {
        if p.module(id).is_none() {
            return Err(ProtocolError::MissingModule(id.clone()));
        }
    }

    // every non-header module present must be listed
    for m in p.modules() {
        if m.id() == MODULE_HEADER {
            continue;
        }
        if !h.modules.iter().any(|id| id == m.id()) {
            return Err(ProtocolError::UnlistedModule(m.id().to_string()));
        }
    }

    Ok((kind, h))
}
