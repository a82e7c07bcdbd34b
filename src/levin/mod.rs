//! Levin framing layer
//!
//! Provides the binary frame format spoken between peers:
//! - Fixed 40-byte header with signature, length, sequence and flags
//! - A `tokio_util` codec that validates lengths before buffering payloads
//! - Typed payload encoding for commands

pub mod codec;
pub mod header;
pub mod payload;

use thiserror::Error;

pub use codec::{try_decode, DecodeResult, LevinCodec, PacketLimit};
pub use header::{
    encode, return_code_name, Frame, FrameKind, Header, LevinFlags, HEADER_SIZE,
    LEVIN_ABSOLUTE_MAX_PACKET_SIZE, LEVIN_DEFAULT_MAX_PACKET_SIZE, LEVIN_ERROR_CONNECTION,
    LEVIN_ERROR_CONNECTION_DESTROYED, LEVIN_ERROR_CONNECTION_HANDLER_NOT_DEFINED,
    LEVIN_ERROR_CONNECTION_NOT_FOUND, LEVIN_ERROR_CONNECTION_NO_DUPLEX_PROTOCOL,
    LEVIN_ERROR_CONNECTION_TIMEDOUT, LEVIN_ERROR_FORMAT, LEVIN_INITIAL_MAX_PACKET_SIZE, LEVIN_OK,
    LEVIN_PROTOCOL_VERSION, LEVIN_SIGNATURE,
};
pub use payload::{decode_payload, encode_payload, LevinCommand, PayloadError};

/// Framing errors; all of them are fatal to the connection
#[derive(Error, Debug)]
pub enum LevinError {
    #[error("Bad signature {0:#018x}")]
    BadSignature(u64),
    #[error("Unsupported protocol version {0}")]
    BadVersion(u32),
    #[error("Invalid flags {0:#x}")]
    InvalidFlags(u32),
    #[error("Header truncated at {0} bytes")]
    ShortHeader(usize),
    #[error("Packet of {size} bytes exceeds the limit of {max}")]
    PacketTooLarge { size: u64, max: u64 },
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
