//! Levin frame header
//!
//! Every frame starts with a fixed 40-byte header, big-endian:
//!
//! | field            | bytes |
//! |------------------|-------|
//! | signature        | 8     |
//! | payload length   | 8     |
//! | protocol version | 4     |
//! | sequence number  | 8     |
//! | flags            | 4     |
//! | return code      | 4     |
//! | command id       | 4     |

use super::LevinError;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

// =============================================================================
// Constants
// =============================================================================

/// Magic value opening every frame
pub const LEVIN_SIGNATURE: u64 = 0x0101_0101_0101_2101;

/// Only protocol version spoken
pub const LEVIN_PROTOCOL_VERSION: u32 = 1;

/// Size of the encoded header
pub const HEADER_SIZE: usize = 40;

/// Hard ceiling for a payload, never exceeded whatever the configuration
pub const LEVIN_ABSOLUTE_MAX_PACKET_SIZE: u64 = 256 * 1024 * 1024;

/// Payload limit for peers that completed the handshake
pub const LEVIN_DEFAULT_MAX_PACKET_SIZE: u64 = 100_000_000;

/// Payload limit before the handshake completes
pub const LEVIN_INITIAL_MAX_PACKET_SIZE: u64 = 256 * 1024;

pub const LEVIN_OK: i32 = 0;
pub const LEVIN_ERROR_CONNECTION: i32 = -1;
pub const LEVIN_ERROR_CONNECTION_NOT_FOUND: i32 = -2;
pub const LEVIN_ERROR_CONNECTION_DESTROYED: i32 = -3;
pub const LEVIN_ERROR_CONNECTION_TIMEDOUT: i32 = -4;
pub const LEVIN_ERROR_CONNECTION_NO_DUPLEX_PROTOCOL: i32 = -5;
pub const LEVIN_ERROR_CONNECTION_HANDLER_NOT_DEFINED: i32 = -6;
pub const LEVIN_ERROR_FORMAT: i32 = -7;

bitflags! {
    /// Frame kind bits; exactly one is set on a valid frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LevinFlags: u32 {
        const REQUEST = 0x1;
        const RESPONSE = 0x2;
        const NOTIFY = 0x4;
    }
}

/// What a frame is, derived from its flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Expects a response with the same sequence number
    Request,
    Response,
    /// Fire and forget
    Notify,
}

impl FrameKind {
    pub fn flags(self) -> LevinFlags {
        match self {
            FrameKind::Request => LevinFlags::REQUEST,
            FrameKind::Response => LevinFlags::RESPONSE,
            FrameKind::Notify => LevinFlags::NOTIFY,
        }
    }

    fn from_flags(flags: LevinFlags) -> Option<Self> {
        if flags == LevinFlags::REQUEST {
            Some(FrameKind::Request)
        } else if flags == LevinFlags::RESPONSE {
            Some(FrameKind::Response)
        } else if flags == LevinFlags::NOTIFY {
            Some(FrameKind::Notify)
        } else {
            None
        }
    }
}

/// Human readable text for a return code
pub fn return_code_name(code: i32) -> &'static str {
    match code {
        LEVIN_OK => "OK",
        LEVIN_ERROR_CONNECTION => "CONNECTION",
        LEVIN_ERROR_CONNECTION_NOT_FOUND => "CONNECTION_NOT_FOUND",
        LEVIN_ERROR_CONNECTION_DESTROYED => "CONNECTION_DESTROYED",
        LEVIN_ERROR_CONNECTION_TIMEDOUT => "CONNECTION_TIMEDOUT",
        LEVIN_ERROR_CONNECTION_NO_DUPLEX_PROTOCOL => "CONNECTION_NO_DUPLEX_PROTOCOL",
        LEVIN_ERROR_CONNECTION_HANDLER_NOT_DEFINED => "CONNECTION_HANDLER_NOT_DEFINED",
        LEVIN_ERROR_FORMAT => "FORMAT",
        _ => "UNKNOWN",
    }
}

// =============================================================================
// Header
// =============================================================================

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u64,
    pub protocol_version: u32,
    pub sequence: u64,
    pub kind: FrameKind,
    pub return_code: i32,
    pub command: u32,
}

impl Header {
    pub fn new(command: u32, kind: FrameKind, sequence: u64, return_code: i32, length: u64) -> Self {
        Self {
            length,
            protocol_version: LEVIN_PROTOCOL_VERSION,
            sequence,
            kind,
            return_code,
            command,
        }
    }

    /// Appends the 40 encoded bytes to `dst`
    pub fn write(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u64(LEVIN_SIGNATURE);
        dst.put_u64(self.length);
        dst.put_u32(self.protocol_version);
        dst.put_u64(self.sequence);
        dst.put_u32(self.kind.flags().bits());
        dst.put_i32(self.return_code);
        dst.put_u32(self.command);
    }

    /// Parses a header from the first `HEADER_SIZE` bytes of `buf`
    pub fn parse(mut buf: &[u8]) -> Result<Self, LevinError> {
        if buf.len() < HEADER_SIZE {
            return Err(LevinError::ShortHeader(buf.len()));
        }
        let signature = buf.get_u64();
        if signature != LEVIN_SIGNATURE {
            return Err(LevinError::BadSignature(signature));
        }
        let length = buf.get_u64();
        let protocol_version = buf.get_u32();
        if protocol_version != LEVIN_PROTOCOL_VERSION {
            return Err(LevinError::BadVersion(protocol_version));
        }
        let sequence = buf.get_u64();
        let raw_flags = buf.get_u32();
        let kind = LevinFlags::from_bits(raw_flags)
            .and_then(FrameKind::from_flags)
            .ok_or(LevinError::InvalidFlags(raw_flags))?;
        let return_code = buf.get_i32();
        let command = buf.get_u32();
        Ok(Self {
            length,
            protocol_version,
            sequence,
            kind,
            return_code,
            command,
        })
    }
}

// =============================================================================
// Frame
// =============================================================================

/// A header with its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    /// Builds a frame; the header length always matches the payload
    pub fn new(command: u32, kind: FrameKind, sequence: u64, return_code: i32, payload: Bytes) -> Self {
        Self {
            header: Header::new(command, kind, sequence, return_code, payload.len() as u64),
            payload,
        }
    }

    pub fn request(command: u32, sequence: u64, payload: Bytes) -> Self {
        Self::new(command, FrameKind::Request, sequence, LEVIN_OK, payload)
    }

    pub fn notify(command: u32, sequence: u64, payload: Bytes) -> Self {
        Self::new(command, FrameKind::Notify, sequence, LEVIN_OK, payload)
    }

    pub fn response(command: u32, sequence: u64, return_code: i32, payload: Bytes) -> Self {
        Self::new(command, FrameKind::Response, sequence, return_code, payload)
    }

    pub fn command(&self) -> u32 {
        self.header.command
    }

    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    /// Bytes on the wire
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encodes a frame into a fresh buffer
pub fn encode(command: u32, is_response: bool, is_notify: bool, sequence: u64, payload: &[u8]) -> BytesMut {
    let kind = match (is_response, is_notify) {
        (true, _) => FrameKind::Response,
        (false, true) => FrameKind::Notify,
        (false, false) => FrameKind::Request,
    };
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    Header::new(command, kind, sequence, LEVIN_OK, payload.len() as u64).write(&mut dst);
    dst.put_slice(payload);
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        Header::new(1001, FrameKind::Request, 7, LEVIN_OK, 300).write(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[..8], &LEVIN_SIGNATURE.to_be_bytes());
        assert_eq!(&buf[8..16], &300u64.to_be_bytes());
        assert_eq!(&buf[16..20], &1u32.to_be_bytes());
        assert_eq!(&buf[20..28], &7u64.to_be_bytes());
        assert_eq!(&buf[28..32], &1u32.to_be_bytes());
        assert_eq!(&buf[32..36], &0i32.to_be_bytes());
        assert_eq!(&buf[36..40], &1001u32.to_be_bytes());
    }

    #[test]
    fn test_header_parse() {
        let mut buf = BytesMut::new();
        let header = Header::new(2004, FrameKind::Response, 99, LEVIN_ERROR_FORMAT, 12);
        header.write(&mut buf);
        assert_eq!(Header::parse(&buf).unwrap(), header);
    }

    #[test]
    fn test_bad_signature() {
        let mut buf = BytesMut::new();
        Header::new(1, FrameKind::Notify, 0, LEVIN_OK, 0).write(&mut buf);
        buf[0] = 0xff;
        assert!(matches!(Header::parse(&buf), Err(LevinError::BadSignature(_))));
    }

    #[test]
    fn test_flags_must_name_one_kind() {
        for raw in [0u32, 0x3, 0x5, 0x7, 0x10] {
            let mut buf = BytesMut::new();
            Header::new(1, FrameKind::Notify, 0, LEVIN_OK, 0).write(&mut buf);
            buf[28..32].copy_from_slice(&raw.to_be_bytes());
            assert!(
                matches!(Header::parse(&buf), Err(LevinError::InvalidFlags(r)) if r == raw),
                "flags {:#x} accepted",
                raw
            );
        }
    }

    #[test]
    fn test_encode_kinds() {
        let notify = encode(2002, false, true, 3, b"abc");
        let header = Header::parse(&notify).unwrap();
        assert_eq!(header.kind, FrameKind::Notify);
        assert_eq!(header.length, 3);
        assert_eq!(&notify[HEADER_SIZE..], b"abc");

        let response = encode(2002, true, false, 3, b"");
        assert_eq!(Header::parse(&response).unwrap().kind, FrameKind::Response);
    }

    #[test]
    fn test_return_code_names() {
        assert_eq!(return_code_name(LEVIN_OK), "OK");
        assert_eq!(return_code_name(LEVIN_ERROR_FORMAT), "FORMAT");
        assert_eq!(return_code_name(42), "UNKNOWN");
    }
}
