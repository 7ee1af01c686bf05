//! Protocol header and frame header parsing, and whole-frame marshaling.

use bytes::{BufMut, BytesMut};

use super::performative::Performative;
use crate::error::CodecError;
use crate::protocol::{FRAME_HEADER_SIZE, MAGIC, PROTO_HEADER_SIZE, VERSION};

type Result<T> = std::result::Result<T, CodecError>;

/// The 8-byte preamble selecting the protocol layer that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoHeader {
    pub proto_id: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl ProtoHeader {
    pub fn new(proto_id: u8) -> Self {
        ProtoHeader {
            proto_id,
            major: VERSION[0],
            minor: VERSION[1],
            revision: VERSION[2],
        }
    }

    pub fn to_bytes(&self) -> [u8; PROTO_HEADER_SIZE] {
        let mut out = [0u8; PROTO_HEADER_SIZE];
        out[0..4].copy_from_slice(MAGIC);
        out[4] = self.proto_id;
        out[5] = self.major;
        out[6] = self.minor;
        out[7] = self.revision;
        out
    }
}

/// Parse a protocol header from the first 8 bytes of `buf`.
pub fn parse_proto_header(buf: &[u8]) -> Result<ProtoHeader> {
    if buf.len() < PROTO_HEADER_SIZE {
        return Err(CodecError::Truncated {
            needed: PROTO_HEADER_SIZE - buf.len(),
        });
    }
    if &buf[0..4] != MAGIC {
        return Err(CodecError::InvalidProtoHeader(format!(
            "bad magic {:02x?}",
            &buf[0..4]
        )));
    }
    let header = ProtoHeader {
        proto_id: buf[4],
        major: buf[5],
        minor: buf[6],
        revision: buf[7],
    };
    if [header.major, header.minor, header.revision] != VERSION {
        return Err(CodecError::UnsupportedVersion(
            header.major,
            header.minor,
            header.revision,
        ));
    }
    Ok(header)
}

/// Fixed part of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size, header included.
    pub size: u32,
    /// Data offset in 4-byte words.
    pub doff: u8,
    pub frame_type: u8,
    pub channel: u16,
}

impl FrameHeader {
    /// Bytes following the fixed 8-byte header (extended header + body).
    pub fn remaining(&self) -> usize {
        self.size as usize - FRAME_HEADER_SIZE
    }

    /// Length of the extended header that precedes the body.
    pub fn extended_len(&self) -> usize {
        self.doff as usize * 4 - FRAME_HEADER_SIZE
    }
}

/// Parse the fixed 8-byte frame header.
pub fn parse_frame_header(buf: &[u8]) -> Result<FrameHeader> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(CodecError::Truncated {
            needed: FRAME_HEADER_SIZE - buf.len(),
        });
    }
    let header = FrameHeader {
        size: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        doff: buf[4],
        frame_type: buf[5],
        channel: u16::from_be_bytes([buf[6], buf[7]]),
    };
    if header.doff < 2 {
        return Err(CodecError::InvalidFrameHeader(format!(
            "data offset {} below minimum 2",
            header.doff
        )));
    }
    if (header.size as usize) < header.doff as usize * 4 {
        return Err(CodecError::InvalidFrameHeader(format!(
            "frame size {} smaller than data offset {}",
            header.size,
            header.doff as usize * 4
        )));
    }
    Ok(header)
}

/// Decode a frame body into a performative.
pub fn parse_frame_body(buf: &[u8]) -> Result<Performative> {
    Performative::decode(buf)
}

/// Marshal a complete frame (header + body) into `buf`.
pub fn write_frame(
    buf: &mut BytesMut,
    frame_type: u8,
    channel: u16,
    body: &Performative,
) -> Result<()> {
    let start = buf.len();
    buf.put_bytes(0, FRAME_HEADER_SIZE);
    body.encode(buf)?;
    let size = u32::try_from(buf.len() - start).map_err(|_| CodecError::TooLarge("frame"))?;
    let hdr = &mut buf[start..start + FRAME_HEADER_SIZE];
    hdr[0..4].copy_from_slice(&size.to_be_bytes());
    hdr[4] = 2;
    hdr[5] = frame_type;
    hdr[6..8].copy_from_slice(&channel.to_be_bytes());
    Ok(())
}
