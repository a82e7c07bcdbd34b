//! Frame extraction
//!
//! `try_decode` is the pure framing step over a byte slice; `LevinCodec`
//! wraps it for `tokio_util::codec::Framed`. Lengths are checked against the
//! packet limit as soon as the header is readable, so a hostile length never
//! causes a buffer reservation.

use super::header::{Frame, Header, HEADER_SIZE, LEVIN_ABSOLUTE_MAX_PACKET_SIZE, LEVIN_SIGNATURE};
use super::LevinError;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Outcome of looking for one frame at the start of a buffer
#[derive(Debug)]
pub enum DecodeResult<'a> {
    /// More bytes are needed
    Incomplete,
    Frame {
        header: Header,
        payload: &'a [u8],
        consumed: usize,
    },
    /// The stream cannot be recovered
    Invalid(LevinError),
}

/// Looks for a complete frame at the start of `buf`
pub fn try_decode(buf: &[u8], max_packet_size: u64) -> DecodeResult<'_> {
    if buf.len() >= 8 {
        let mut signature = [0u8; 8];
        signature.copy_from_slice(&buf[..8]);
        let signature = u64::from_be_bytes(signature);
        if signature != LEVIN_SIGNATURE {
            return DecodeResult::Invalid(LevinError::BadSignature(signature));
        }
    }
    if buf.len() < HEADER_SIZE {
        return DecodeResult::Incomplete;
    }

    let header = match Header::parse(buf) {
        Ok(header) => header,
        Err(e) => return DecodeResult::Invalid(e),
    };
    let max = max_packet_size.min(LEVIN_ABSOLUTE_MAX_PACKET_SIZE);
    if header.length > max {
        return DecodeResult::Invalid(LevinError::PacketTooLarge {
            size: header.length,
            max,
        });
    }

    let total = HEADER_SIZE + header.length as usize;
    if buf.len() < total {
        return DecodeResult::Incomplete;
    }
    DecodeResult::Frame {
        header,
        payload: &buf[HEADER_SIZE..total],
        consumed: total,
    }
}

// =============================================================================
// Packet Limit
// =============================================================================

/// Payload size limit shared between a connection and its codec.
///
/// The limit is raised once the peer completes the handshake.
#[derive(Debug, Clone)]
pub struct PacketLimit(Arc<AtomicU64>);

impl PacketLimit {
    pub fn new(max: u64) -> Self {
        Self(Arc::new(AtomicU64::new(max.min(LEVIN_ABSOLUTE_MAX_PACKET_SIZE))))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, max: u64) {
        self.0
            .store(max.min(LEVIN_ABSOLUTE_MAX_PACKET_SIZE), Ordering::Relaxed);
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Levin codec for `Framed`
#[derive(Debug, Clone)]
pub struct LevinCodec {
    limit: PacketLimit,
}

impl LevinCodec {
    pub fn new(limit: PacketLimit) -> Self {
        Self { limit }
    }

    pub fn with_max_packet_size(max: u64) -> Self {
        Self::new(PacketLimit::new(max))
    }

    pub fn limit(&self) -> &PacketLimit {
        &self.limit
    }
}

impl Default for LevinCodec {
    fn default() -> Self {
        Self::with_max_packet_size(LEVIN_ABSOLUTE_MAX_PACKET_SIZE)
    }
}

impl Decoder for LevinCodec {
    type Item = Frame;
    type Error = LevinError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let decoded = match try_decode(src, self.limit.get()) {
            DecodeResult::Incomplete => None,
            DecodeResult::Invalid(e) => return Err(e),
            DecodeResult::Frame {
                header, consumed, ..
            } => Some((header, consumed)),
        };
        let Some((header, consumed)) = decoded else {
            // The length was validated if the header is complete
            if let Ok(header) = Header::parse(src) {
                let total = HEADER_SIZE + header.length as usize;
                src.reserve(total.saturating_sub(src.len()));
            }
            return Ok(None);
        };

        let mut frame = src.split_to(consumed);
        frame.advance(HEADER_SIZE);
        Ok(Some(Frame {
            header,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<Frame> for LevinCodec {
    type Error = LevinError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = item.payload.len() as u64;
        if size > LEVIN_ABSOLUTE_MAX_PACKET_SIZE {
            return Err(LevinError::PacketTooLarge {
                size,
                max: LEVIN_ABSOLUTE_MAX_PACKET_SIZE,
            });
        }
        dst.reserve(item.wire_size());
        item.header.write(dst);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
