//! packet.rs - framing of booster packets onto a byte stream.
//!
//! Wire layout of one packet:
//!
//! ```text
//! <PacketOpen:4> <moduleCount:u16 BE>
//!   { <moduleID:2 ASCII> <sep:1> <size:u16 BE> <sep:1>
//!     <encoding:u8> <PayloadOpen:2> <payload:size bytes> <PayloadClose:2> } * moduleCount
//! <PacketClose:4>
//! ```
//!
//! The codec is stateless: an `Encoder`/`Decoder` pair may be used
//! concurrently on different streams.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::{
    PACKET_CLOSING_TAG, PACKET_OPENING_TAG, PAYLOAD_CLOSING_TAG, PAYLOAD_OPENING_TAG, SEPARATOR,
};

/// Upper bound on a single module payload. The size field is 16 bits wide.
pub const MAX_MODULE_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum PacketError {
    /// A framing tag was missing or misplaced. The stream is unrecoverable.
    #[error("packet: bad frame: {0}")]
    Frame(&'static str),
    /// A declared size was out of bounds, or the stream ended early.
    #[error("packet: bad size: {0}")]
    Size(String),
    /// A module identifier was not two ASCII characters.
    #[error("packet: invalid module id [{0}]")]
    InvalidId(String),
    #[error("packet: io: {0}")]
    Io(#[from] std::io::Error),
}

/// A named, sized, typed slice inside a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    id: String,
    encoding: u8,
    payload: Bytes,
}

impl Module {
    pub fn new(id: &str, payload: impl Into<Bytes>, encoding: u8) -> Result<Module, PacketError> {
        if id.len() != 2 || !id.is_ascii() {
            return Err(PacketError::InvalidId(id.to_string()));
        }
        let payload = payload.into();
        if payload.len() > MAX_MODULE_SIZE {
            return Err(PacketError::Size(format!(
                "module [{}] payload is {} bytes, max {}",
                id,
                payload.len(),
                MAX_MODULE_SIZE
            )));
        }
        Ok(Module {
            id: id.to_string(),
            encoding,
            payload,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn encoding(&self) -> u8 {
        self.encoding
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// An ordered mapping from module id to module. Insertion order is the
/// stream order on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    modules: Vec<Module>,
}

impl Packet {
    pub fn new() -> Packet {
        Packet::default()
    }

    /// Adds a module to the packet. A module with the same id replaces the
    /// previous one in place, keeping its position.
    pub fn add_module(
        &mut self,
        id: &str,
        payload: impl Into<Bytes>,
        encoding: u8,
    ) -> Result<(), PacketError> {
        let m = Module::new(id, payload, encoding)?;
        match self.modules.iter_mut().find(|e| e.id == m.id) {
            Some(slot) => *slot = m,
            None => self.modules.push(m),
        }
        Ok(())
    }

    pub fn module(&self, id: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

// --- Encoder ---

pub struct Encoder<W> {
    w: W,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    pub fn new(w: W) -> Encoder<W> {
        Encoder { w }
    }

    /// Frames and writes a whole packet. The packet is assembled in memory
    /// first so the stream sees a single contiguous write.
    pub async fn encode(&mut self, p: &Packet) -> Result<(), PacketError> {
        if p.len() > u16::MAX as usize {
            return Err(PacketError::Size(format!("{} modules", p.len())));
        }

        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(&PACKET_OPENING_TAG);
        buf.put_u16(p.len() as u16);

        for m in p.modules() {
            buf.put_slice(m.id.as_bytes());
            buf.put_u8(SEPARATOR);
            buf.put_u16(m.payload.len() as u16);
            buf.put_u8(SEPARATOR);
            buf.put_u8(m.encoding);
            buf.put_slice(&PAYLOAD_OPENING_TAG);
            buf.put_slice(&m.payload);
            buf.put_slice(&PAYLOAD_CLOSING_TAG);
        }

        buf.put_slice(&PACKET_CLOSING_TAG);

        self.w.write_all(&buf).await?;
        self.w.flush().await?;
        Ok(())
    }
}

// --- Decoder ---

pub struct Decoder<R> {
    r: BufReader<R>,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    pub fn new(r: R) -> Decoder<R> {
        Decoder {
            r: BufReader::new(r),
        }
    }

    /// Reads exactly one framed packet off the stream.
    pub async fn decode(&mut self) -> Result<Packet, PacketError> {
        read_tag(&mut self.r, &PACKET_OPENING_TAG, "packet opening tag").await?;

        let count = read_u16(&mut self.r).await? as usize;
        let mut p = Packet::new();

        for _ in 0..count {
            let m = self.decode_module().await?;
            match p.modules.iter_mut().find(|e| e.id == m.id) {
                Some(slot) => *slot = m,
                None => p.modules.push(m),
            }
        }

        read_tag(&mut self.r, &PACKET_CLOSING_TAG, "packet closing tag").await?;
        Ok(p)
    }

    async fn decode_module(&mut self) -> Result<Module, PacketError> {
        let r = &mut self.r;

        let mut id = [0u8; 2];
        read_full(r, &mut id).await?;
        if !id.is_ascii() {
            return Err(PacketError::InvalidId(format!("{:02x}{:02x}", id[0], id[1])));
        }
        let id = String::from_utf8_lossy(&id).into_owned();

        read_byte_tag(r, SEPARATOR, "module separator").await?;
        let size = read_u16(r).await? as usize;
        read_byte_tag(r, SEPARATOR, "module separator").await?;

        let mut enc = [0u8; 1];
        read_full(r, &mut enc).await?;

        read_tag(r, &PAYLOAD_OPENING_TAG, "payload opening tag").await?;

        let mut payload = vec![0u8; size];
        read_full(r, &mut payload).await?;

        read_tag(r, &PAYLOAD_CLOSING_TAG, "payload closing tag").await?;

        Ok(Module {
            id,
            encoding: enc[0],
            payload: payload.into(),
        })
    }
}

async fn read_full<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<(), PacketError> {
    match r.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(PacketError::Size("stream ended early".to_string()))
        }
        Err(e) => Err(PacketError::Io(e)),
    }
}

async fn read_u16<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16, PacketError> {
    let mut buf = [0u8; 2];
    read_full(r, &mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

async fn read_tag<R: AsyncRead + Unpin>(
    r: &mut R,
    tag: &[u8],
    what: &'static str,
) -> Result<(), PacketError> {
    let mut buf = [0u8; 4];
    let buf = &mut buf[..tag.len()];
    read_full(r, buf).await?;
    if buf != tag {
        return Err(PacketError::Frame(what));
    }
    Ok(())
}

async fn read_byte_tag<R: AsyncRead + Unpin>(
    r: &mut R,
    tag: u8,
    what: &'static str,
) -> Result<(), PacketError> {
    let mut buf = [0u8; 1];
    read_full(r, &mut buf).await?;
    if buf[0] != tag {
        return Err(PacketError::Frame(what));
    }
    Ok(())
}
