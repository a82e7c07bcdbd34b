//! Typed command payloads
//!
//! Payloads are bincode-encoded serde structs. Decoding is limited to the
//! size of the received buffer, so length prefixes inside a payload cannot
//! make us allocate more than the peer actually sent.

use super::header::LEVIN_ABSOLUTE_MAX_PACKET_SIZE;
use bincode::Options;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Payload encoding errors
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Failed to encode payload: {0}")]
    Encode(bincode::Error),
    #[error("Malformed payload: {0}")]
    Decode(bincode::Error),
}

/// A message bound to a levin command id
pub trait LevinCommand: Serialize + DeserializeOwned {
    const ID: u32;
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes, PayloadError> {
    bincode::DefaultOptions::new()
        .with_limit(LEVIN_ABSOLUTE_MAX_PACKET_SIZE)
        .serialize(value)
        .map(Bytes::from)
        .map_err(PayloadError::Encode)
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadError> {
    bincode::DefaultOptions::new()
        .with_limit(bytes.len() as u64)
        .deserialize(bytes)
        .map_err(PayloadError::Decode)
}
