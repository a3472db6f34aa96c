//! protocol - the booster control-plane wire contract.
//!
//! A booster packet is an ordered collection of named modules framed onto a
//! TCP stream (see `packet`). Every packet carries a protobuf-encoded header
//! module that names the message kind and the other modules present; the
//! payload module holds the message-specific schema (see `payload`).

pub mod packet;
pub mod payload;

use std::time::Duration;

/// Protocol version string carried in every header. Peers speaking a
/// different version are rejected.
pub const VERSION: &str = "booster/0.3";

// --- Framing tags ---
//
// These byte strings are part of the wire contract and must match on both
// ends of a link. They are plain ASCII sequences that do not occur at the
// positions the decoder checks them unless the stream is misframed.
pub const PACKET_OPENING_TAG: [u8; 4] = *b">>>{";
pub const PACKET_CLOSING_TAG: [u8; 4] = *b"}<<<";
pub const PAYLOAD_OPENING_TAG: [u8; 2] = *b"($";
pub const PAYLOAD_CLOSING_TAG: [u8; 2] = *b"$)";
pub const SEPARATOR: u8 = b':';

// --- Reserved module identifiers ---

/// Header module, present in every packet.
pub const MODULE_HEADER: &str = "HE";
/// Payload module, present whenever the message kind carries a body.
pub const MODULE_PAYLOAD: &str = "PA";

/// Module payload encodings. Protobuf is the only one currently spoken.
pub const ENCODING_PROTOBUF: u8 = 0;

/// Accepted clock skew between `sent_at` and local time.
pub const SKEW_WINDOW: Duration = Duration::from_secs(30);

/// Message kinds, carried as `header.id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageKind {
    Hello = 0,
    Connect = 1,
    Disconnect = 2,
    Heartbeat = 3,
    Notify = 4,
    Inspect = 5,
    TunnelEvent = 6,
    Node = 7,
    Bandwidth = 8,
    Ctrl = 9,
}

impl MessageKind {
    pub fn from_id(id: i32) -> Option<MessageKind> {
        use MessageKind::*;
        Some(match id {
            0 => Hello,
            1 => Connect,
            2 => Disconnect,
            3 => Heartbeat,
            4 => Notify,
            5 => Inspect,
            6 => TunnelEvent,
            7 => Node,
            8 => Bandwidth,
            9 => Ctrl,
            _ => return None,
        })
    }

    pub fn id(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageKind::Hello => "hello",
            MessageKind::Connect => "connect",
            MessageKind::Disconnect => "disconnect",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Notify => "notify",
            MessageKind::Inspect => "inspect",
            MessageKind::TunnelEvent => "tunnel",
            MessageKind::Node => "node",
            MessageKind::Bandwidth => "bandwidth",
            MessageKind::Ctrl => "ctrl",
        };
        f.write_str(s)
    }
}
